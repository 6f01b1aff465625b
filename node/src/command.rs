use std::path::PathBuf;
use std::str::FromStr;

use crate::Id;

/// One line of the operator command stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Upload { name: String, path: PathBuf },
    Retrieve { name: String },
    Search { name: String, word: Vec<u8> },
    List { name: String },
    Failover(Id),
    Recover(Id),
    Exit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("missing argument: {0}")]
    Missing(&'static str),
    #[error("node is not a number: {0}")]
    NotANode(String),
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut args = line.split_whitespace();
        let cmd = args.next().ok_or(ParseError::Empty)?;
        let mut arg = |name| args.next().ok_or(ParseError::Missing(name));

        Ok(match cmd {
            "upload" => Command::Upload {
                name: arg("name")?.to_owned(),
                path: PathBuf::from(arg("path")?),
            },
            // an output path may follow, it is ignored
            "retrieve" => Command::Retrieve {
                name: arg("name")?.to_owned(),
            },
            "search" => Command::Search {
                name: arg("name")?.to_owned(),
                word: arg("word")?.as_bytes().to_vec(),
            },
            "list_file" => Command::List {
                name: arg("name")?.to_owned(),
            },
            "failover" => Command::Failover(node(arg("node")?)?),
            "recover" => Command::Recover(node(arg("node")?)?),
            "exit" => Command::Exit,
            other => return Err(ParseError::Unknown(other.to_owned())),
        })
    }
}

fn node(arg: &str) -> Result<Id, ParseError> {
    arg.parse()
        .map_err(|_| ParseError::NotANode(arg.to_owned()))
}
