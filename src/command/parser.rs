//! Recursive-descent parser for the command-file grammar.
//!
//! ```text
//! file        := keyword EOL credential body
//! ChangePart  := credential (SP name SP key | EOL name SP key)
//! ShowConf    := credential EOL conf-credential
//! UpdateConf  := credential EOL conf-credential EOL header EOL root-key EOL header EOL
//!                record{2..10}
//! InitConf    := device-id
//! record      := index name key sector-count
//! ```
//!
//! Parsing never touches device state: the result borrows from the input and
//! `TableSpec::build` turns records into a candidate table.

use heapless::Vec as BoundedVec;

use crate::config::MAX_PARTITIONS;
use crate::partition::{EncryptionMode, Partition, PartitionError, PartitionTable};

use super::tokenizer::{Token, Tokenizer};

pub const CHANGE_PARTITION_KEYWORD: &str = "ChangePart";
pub const UPDATE_CONF_KEYWORD: &str = "UpdateConf";
pub const SHOW_CONF_KEYWORD: &str = "ShowConf";
pub const INIT_CONF_KEYWORD: &str = "InitConf";

/// Smallest table an `UpdateConf` may describe
pub const MIN_RECORDS: usize = 2;

/// Error types for command-file grammar
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Command file is empty")]
    Empty,
    #[error("Command file is not valid UTF-8")]
    NotUtf8,
    #[error("Command file exceeds {0} bytes")]
    TooLong(usize),
    #[error("Missing {0}")]
    Missing(&'static str),
    #[error("Too few partition records: {0}")]
    TooFewRecords(usize),
    #[error("Invalid partition record: {0}")]
    Record(#[from] PartitionError),
}

/// One `<index> <name> <key> <sectorCount>` line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordSpec<'a> {
    pub index: u32,
    pub name: &'a str,
    pub key: &'a str,
    pub sector_count: u32,
}

/// Partition records of an `UpdateConf`, in file order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableSpec<'a> {
    records: BoundedVec<RecordSpec<'a>, MAX_PARTITIONS>,
}

impl<'a> TableSpec<'a> {
    #[must_use]
    pub fn records(&self) -> &[RecordSpec<'a>] {
        &self.records
    }

    /// Lay the records out back to back from sector 0
    ///
    /// Record 0 is always public whatever key it names. Every other record
    /// is public iff its key is the public sentinel.
    pub fn build(&self, root_key: &str, conf_key: &str) -> Result<PartitionTable, ParseError> {
        let mut table = PartitionTable::new(root_key, conf_key)?;
        let mut start: u32 = 0;
        for (position, record) in self.records.iter().enumerate() {
            let partition = if position == 0 {
                Partition::public(record.name, 0, record.sector_count)?
            } else {
                Partition::new(
                    record.name,
                    record.key,
                    start,
                    record.sector_count,
                    EncryptionMode::for_key(record.key),
                )?
            };
            start = partition
                .last_sector
                .checked_add(1)
                .ok_or(PartitionError::ExtentOverflow)?;
            table.push(partition)?;
        }
        Ok(table)
    }
}

/// A parsed command file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command<'a> {
    ChangePartition {
        credential: &'a str,
        name: &'a str,
        key: &'a str,
    },
    UpdateConf {
        credential: &'a str,
        conf_credential: &'a str,
        spec: TableSpec<'a>,
    },
    ShowConf {
        credential: &'a str,
        conf_credential: &'a str,
    },
    InitConf {
        device_id: &'a str,
    },
    NoCommand,
}

/// Command kinds, for reporting
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    ChangePartition,
    UpdateConf,
    ShowConf,
    InitConf,
    NoCommand,
}

impl Command<'_> {
    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::ChangePartition { .. } => CommandKind::ChangePartition,
            Self::UpdateConf { .. } => CommandKind::UpdateConf,
            Self::ShowConf { .. } => CommandKind::ShowConf,
            Self::InitConf { .. } => CommandKind::InitConf,
            Self::NoCommand => CommandKind::NoCommand,
        }
    }
}

/// Parse raw command-file bytes
pub fn parse_bytes(input: &[u8]) -> Result<Command<'_>, ParseError> {
    let text = core::str::from_utf8(input).map_err(|_| ParseError::NotUtf8)?;
    parse(text)
}

/// Parse a command file
pub fn parse(input: &str) -> Result<Command<'_>, ParseError> {
    let mut tok = Tokenizer::new(input);
    if tok.is_at_end() {
        return Err(ParseError::Empty);
    }

    match tok.line() {
        CHANGE_PARTITION_KEYWORD => parse_change_partition(&mut tok),
        UPDATE_CONF_KEYWORD => parse_update_conf(&mut tok),
        SHOW_CONF_KEYWORD => parse_show_conf(&mut tok),
        INIT_CONF_KEYWORD => Ok(Command::InitConf {
            device_id: first_word(&mut tok, "device identifier")?,
        }),
        _ => Ok(Command::NoCommand),
    }
}

/// First word of a line; the rest of that line is left unread
fn first_word<'a>(tok: &mut Tokenizer<'a>, what: &'static str) -> Result<&'a str, ParseError> {
    tok.word().ok_or(ParseError::Missing(what))
}

/// First word of a line, consuming the whole line
fn credential_line<'a>(tok: &mut Tokenizer<'a>, what: &'static str) -> Result<&'a str, ParseError> {
    let word = first_word(tok, what)?;
    tok.rest_of_line();
    Ok(word)
}

fn parse_change_partition<'a>(tok: &mut Tokenizer<'a>) -> Result<Command<'a>, ParseError> {
    let credential = first_word(tok, "root key")?;
    let mut target = tok.rest_of_line();
    if target.is_empty() {
        target = tok.rest_of_line();
    }
    if target.is_empty() {
        return Err(ParseError::Missing("partition name"));
    }

    // The key is everything after the first blank, verbatim
    let (name, key) = target
        .split_once(|c: char| c == ' ' || c == '\t')
        .unwrap_or((target, ""));
    Ok(Command::ChangePartition { credential, name, key })
}

fn parse_show_conf<'a>(tok: &mut Tokenizer<'a>) -> Result<Command<'a>, ParseError> {
    let credential = credential_line(tok, "root key")?;
    let conf_credential = first_word(tok, "conf key")?;
    Ok(Command::ShowConf { credential, conf_credential })
}

fn parse_update_conf<'a>(tok: &mut Tokenizer<'a>) -> Result<Command<'a>, ParseError> {
    let credential = credential_line(tok, "root key")?;
    let conf_credential = credential_line(tok, "conf key")?;
    if !tok.skip_line() {
        return Err(ParseError::Missing("header line"));
    }
    // Repeated root key: required, value not enforced
    credential_line(tok, "repeated root key")?;
    if !tok.skip_line() {
        return Err(ParseError::Missing("table header line"));
    }

    let mut spec = TableSpec::default();
    while !spec.records.is_full() {
        let mut attempt = tok.clone();
        let Some(record) = parse_record(&mut attempt) else {
            break;
        };
        *tok = attempt;
        spec.records
            .push(record)
            .map_err(|_| PartitionError::TableFull)?;
    }

    if spec.records.len() < MIN_RECORDS {
        return Err(ParseError::TooFewRecords(spec.records.len()));
    }
    Ok(Command::UpdateConf {
        credential,
        conf_credential,
        spec,
    })
}

/// `<index> <name> <key> <sectorCount>`; `None` ends the record list
fn parse_record<'a>(tok: &mut Tokenizer<'a>) -> Option<RecordSpec<'a>> {
    let mut words: BoundedVec<&'a str, 4> = BoundedVec::new();
    for token in tok.by_ref() {
        match token {
            // A fifth word rejects the line
            Token::Word(word) => words.push(word).ok()?,
            Token::LineEnd => break,
        }
    }

    match *words.as_slice() {
        [index, name, key, sector_count] => Some(RecordSpec {
            index: index.parse().ok()?,
            name,
            key,
            sector_count: sector_count.parse().ok()?,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{NAME_LEN, PUBLIC_PARTITION_KEY};

    const UPDATE: &str = "UpdateConf\nrootKey\nconfKey\n\nrootKey\n#  Name  Key  SectorCount\n\
                          0 pub public 100\n1 secret s3cret 200\n2 open public 50\n";

    #[test]
    fn test_change_partition_on_third_line() {
        let cmd = parse("ChangePart\nrootKey\npart1 part1Key\n").unwrap();
        assert_eq!(
            cmd,
            Command::ChangePartition { credential: "rootKey", name: "part1", key: "part1Key" }
        );
    }

    #[test]
    fn test_change_partition_on_credential_line() {
        let cmd = parse("ChangePart\r\nrootKey part1 key with spaces\r\n").unwrap();
        assert_eq!(
            cmd,
            Command::ChangePartition {
                credential: "rootKey",
                name: "part1",
                key: "key with spaces"
            }
        );
    }

    #[test]
    fn test_change_partition_tab_separates_name_and_key() {
        let cmd = parse("ChangePart\nrootKey\npart1\tpart1Key\n").unwrap();
        assert_eq!(
            cmd,
            Command::ChangePartition { credential: "rootKey", name: "part1", key: "part1Key" }
        );
    }

    #[test]
    fn test_change_partition_public_without_key() {
        let cmd = parse("ChangePart\nrootKey\npart0").unwrap();
        assert_eq!(cmd, Command::ChangePartition { credential: "rootKey", name: "part0", key: "" });
    }

    #[test]
    fn test_change_partition_missing_target() {
        assert_eq!(parse("ChangePart\nrootKey\n"), Err(ParseError::Missing("partition name")));
        assert_eq!(parse("ChangePart\n"), Err(ParseError::Missing("root key")));
    }

    #[test]
    fn test_keyword_is_case_sensitive_exact() {
        assert_eq!(parse("changepart\nrootKey\np k\n"), Ok(Command::NoCommand));
        assert_eq!(parse("ChangePart extra\nrootKey\np k\n"), Ok(Command::NoCommand));
        assert_eq!(parse("\nChangePart\n"), Ok(Command::NoCommand));
        assert_eq!(parse(" ChangePart\nrootKey\np k\n"), Ok(Command::NoCommand));
        assert_eq!(parse("\tShowConf\nrootKey\nconfKey\n"), Ok(Command::NoCommand));
        assert_eq!(parse("ChangePart \nrootKey\np k\n"), Ok(Command::NoCommand));
        assert_eq!(parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn test_show_conf() {
        let cmd = parse("ShowConf\nrootKey\nconfKey").unwrap();
        assert_eq!(cmd, Command::ShowConf { credential: "rootKey", conf_credential: "confKey" });
        assert_eq!(parse("ShowConf\nrootKey\n"), Err(ParseError::Missing("conf key")));
    }

    #[test]
    fn test_init_conf() {
        assert_eq!(
            parse("InitConf\ndeviceUniqueID\n").unwrap(),
            Command::InitConf { device_id: "deviceUniqueID" }
        );
    }

    #[test]
    fn test_update_conf_records() {
        let Command::UpdateConf { credential, conf_credential, spec } = parse(UPDATE).unwrap()
        else {
            panic!("expected UpdateConf");
        };
        assert_eq!(credential, "rootKey");
        assert_eq!(conf_credential, "confKey");
        assert_eq!(spec.records().len(), 3);
        assert_eq!(
            spec.records()[1],
            RecordSpec { index: 1, name: "secret", key: "s3cret", sector_count: 200 }
        );
    }

    #[test]
    fn test_update_conf_stops_at_first_bad_record() {
        let input = "UpdateConf\nr\nc\n\nr\nhdr\n0 a public 10\n1 b k 10\nx c k 10\n2 d k 10\n";
        let Command::UpdateConf { spec, .. } = parse(input).unwrap() else {
            panic!("expected UpdateConf");
        };
        assert_eq!(spec.records().len(), 2);
    }

    #[test]
    fn test_update_conf_missing_token_ends_records() {
        let input = "UpdateConf\nr\nc\n\nr\nhdr\n0 a public 10\n1 b 10\n";
        assert_eq!(parse(input), Err(ParseError::TooFewRecords(1)));
    }

    #[test]
    fn test_update_conf_caps_record_count() {
        let mut input = String::from("UpdateConf\nr\nc\n\nr\nhdr\n");
        for i in 0..MAX_PARTITIONS + 3 {
            input.push_str(&format!("{} p{} k 1\n", i, i));
        }
        let Command::UpdateConf { spec, .. } = parse(&input).unwrap() else {
            panic!("expected UpdateConf");
        };
        assert_eq!(spec.records().len(), MAX_PARTITIONS);
    }

    #[test]
    fn test_update_conf_requires_repeated_root_line() {
        assert_eq!(
            parse("UpdateConf\nr\nc\n\n"),
            Err(ParseError::Missing("repeated root key"))
        );
        assert_eq!(parse("UpdateConf\nr\nc\n"), Err(ParseError::Missing("header line")));
    }

    #[test]
    fn test_build_lays_out_contiguously() {
        let Command::UpdateConf { spec, .. } = parse(UPDATE).unwrap() else {
            panic!("expected UpdateConf");
        };
        let table = spec.build("rootKey", "confKey").unwrap();
        let parts = table.partitions();

        assert_eq!((parts[0].start_sector, parts[0].last_sector), (0, 99));
        assert_eq!((parts[1].start_sector, parts[1].last_sector), (100, 299));
        assert_eq!((parts[2].start_sector, parts[2].last_sector), (300, 349));
        assert!(parts[1].is_private());
        assert!(!parts[2].is_private());
        assert_eq!(table.root_key(), "rootKey");
    }

    #[test]
    fn test_build_forces_first_record_public() {
        let input = "UpdateConf\nr\nc\n\nr\nhdr\n0 first secret 10\n1 second k 10\n";
        let Command::UpdateConf { spec, .. } = parse(input).unwrap() else {
            panic!("expected UpdateConf");
        };
        let table = spec.build("r", "c").unwrap();
        let first = &table.partitions()[0];
        assert!(!first.is_private());
        assert_eq!(first.key.as_str(), PUBLIC_PARTITION_KEY);
    }

    #[test]
    fn test_build_rejects_overlong_name() {
        let long = "n".repeat(NAME_LEN + 1);
        let input = format!("UpdateConf\nr\nc\n\nr\nhdr\n0 a public 10\n1 {} k 10\n", long);
        let Command::UpdateConf { spec, .. } = parse(&input).unwrap() else {
            panic!("expected UpdateConf");
        };
        assert!(matches!(
            spec.build("r", "c"),
            Err(ParseError::Record(PartitionError::TooLong { .. }))
        ));
    }

    #[test]
    fn test_parse_bytes_rejects_invalid_utf8() {
        assert_eq!(parse_bytes(&[0xff, 0xfe]), Err(ParseError::NotUtf8));
    }
}
