//! Wire commands exchanged between the Initiator and the Hub.
//!
//! Every command is a single UTF-8 line. Path fields are written inside double
//! quotes with no escaping, so a path may contain spaces but never a `"`:
//!
//! ```text
//! UPLOAD_FILE "notes/todo list.txt" 42
//! RENAME_DIRECTORY "docs" "documents"
//! ```
//!
//! `UPLOAD_FILE` and `DOWNLOAD_FILE` are followed by a raw payload; see
//! [`crate::codec`] for how it is framed.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const UPLOAD_FILE: &str = "UPLOAD_FILE";
pub const DOWNLOAD_FILE: &str = "DOWNLOAD_FILE";
pub const DELETE_FILE: &str = "DELETE_FILE";
pub const RENAME_FILE: &str = "RENAME_FILE";
pub const CREATE_DIRECTORY: &str = "CREATE_DIRECTORY";
pub const DELETE_DIRECTORY: &str = "DELETE_DIRECTORY";
pub const RENAME_DIRECTORY: &str = "RENAME_DIRECTORY";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Empty command line")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownKeyword(String),

    #[error("{keyword}: missing {field}")]
    MissingArgument {
        keyword: &'static str,
        field: &'static str,
    },

    #[error("{keyword}: unexpected argument {token:?}")]
    UnexpectedArgument { keyword: &'static str, token: String },

    #[error("Unterminated quoted path")]
    UnterminatedQuote,

    #[error("Quoted path must be followed by whitespace")]
    TrailingAfterQuote,

    #[error("Empty path")]
    EmptyPath,

    #[error("Invalid file size: {0:?}")]
    InvalidSize(String),

    #[error("Path cannot be encoded on the wire: {0:?}")]
    UnencodablePath(String),

    #[error("Command line is not valid UTF-8")]
    InvalidUtf8,

    #[error("Command line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// One unit of the wire protocol describing a single filesystem change.
///
/// All paths are relative to the watched root and `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// File contents follow on the same stream; size is part of the line.
    UploadFile { path: String, size: u64 },
    /// File contents follow; size is sent on its own line after the command.
    DownloadFile { path: String },
    DeleteFile { path: String },
    RenameFile { from: String, to: String },
    CreateDirectory { path: String },
    DeleteDirectory { path: String },
    RenameDirectory { from: String, to: String },
}

impl Command {
    /// The keyword that starts this command's line.
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::UploadFile { .. } => UPLOAD_FILE,
            Command::DownloadFile { .. } => DOWNLOAD_FILE,
            Command::DeleteFile { .. } => DELETE_FILE,
            Command::RenameFile { .. } => RENAME_FILE,
            Command::CreateDirectory { .. } => CREATE_DIRECTORY,
            Command::DeleteDirectory { .. } => DELETE_DIRECTORY,
            Command::RenameDirectory { .. } => RENAME_DIRECTORY,
        }
    }

    /// Whether a raw byte payload follows this command on the stream.
    pub fn carries_payload(&self) -> bool {
        matches!(
            self,
            Command::UploadFile { .. } | Command::DownloadFile { .. }
        )
    }

    /// The path this command primarily refers to (the source for renames).
    pub fn path(&self) -> &str {
        match self {
            Command::UploadFile { path, .. }
            | Command::DownloadFile { path }
            | Command::DeleteFile { path }
            | Command::CreateDirectory { path }
            | Command::DeleteDirectory { path } => path,
            Command::RenameFile { from, .. } | Command::RenameDirectory { from, .. } => from,
        }
    }

    /// Encode the command as a wire line, including the trailing `\n`.
    ///
    /// Fails if a path is empty or contains a character the grammar has no
    /// way to express (`"` or a line break).
    pub fn encode(&self) -> Result<String, CommandError> {
        for path in self.paths() {
            check_encodable(path)?;
        }
        Ok(format!("{}\n", self))
    }

    /// Every path the command refers to.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Command::RenameFile { from, to } | Command::RenameDirectory { from, to } => {
                vec![from, to]
            }
            other => vec![other.path()],
        }
    }

    /// Parse one command line (without its line terminator).
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = Tokens::new(line);
        let keyword = match tokens.next_token()? {
            Some(Token::Bare(word)) => word,
            Some(Token::Quoted(word)) => return Err(CommandError::UnknownKeyword(word.to_string())),
            None => return Err(CommandError::Empty),
        };

        let command = match keyword {
            UPLOAD_FILE => {
                let path = tokens.path(UPLOAD_FILE, "path")?;
                let size = tokens.size(UPLOAD_FILE)?;
                Command::UploadFile { path, size }
            }
            DOWNLOAD_FILE => Command::DownloadFile {
                path: tokens.path(DOWNLOAD_FILE, "path")?,
            },
            DELETE_FILE => Command::DeleteFile {
                path: tokens.path(DELETE_FILE, "path")?,
            },
            RENAME_FILE => Command::RenameFile {
                from: tokens.path(RENAME_FILE, "old path")?,
                to: tokens.path(RENAME_FILE, "new path")?,
            },
            CREATE_DIRECTORY => Command::CreateDirectory {
                path: tokens.path(CREATE_DIRECTORY, "path")?,
            },
            DELETE_DIRECTORY => Command::DeleteDirectory {
                path: tokens.path(DELETE_DIRECTORY, "path")?,
            },
            RENAME_DIRECTORY => Command::RenameDirectory {
                from: tokens.path(RENAME_DIRECTORY, "old path")?,
                to: tokens.path(RENAME_DIRECTORY, "new path")?,
            },
            other => return Err(CommandError::UnknownKeyword(other.to_string())),
        };

        tokens.finish(command.keyword())?;
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::UploadFile { path, size } => write!(f, "{} \"{}\" {}", UPLOAD_FILE, path, size),
            Command::RenameFile { from, to } | Command::RenameDirectory { from, to } => {
                write!(f, "{} \"{}\" \"{}\"", self.keyword(), from, to)
            }
            other => write!(f, "{} \"{}\"", other.keyword(), other.path()),
        }
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Command::parse(s)
    }
}

/// Parse the size line that follows a `DOWNLOAD_FILE` command.
pub fn parse_size_line(line: &str) -> Result<u64, CommandError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CommandError::InvalidSize(trimmed.to_string()));
    }
    trimmed
        .parse()
        .map_err(|_| CommandError::InvalidSize(trimmed.to_string()))
}

fn check_encodable(path: &str) -> Result<(), CommandError> {
    if path.is_empty() {
        return Err(CommandError::EmptyPath);
    }
    if path.contains(['"', '\n', '\r']) {
        return Err(CommandError::UnencodablePath(path.to_string()));
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Bare(&'a str),
    Quoted(&'a str),
}

/// Whitespace-separated tokenizer; a token starting with `"` runs to the next `"`.
struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self { rest: line }
    }

    fn next_token(&mut self) -> Result<Option<Token<'a>>, CommandError> {
        self.rest = self.rest.trim_start();
        if self.rest.is_empty() {
            return Ok(None);
        }

        if let Some(after_quote) = self.rest.strip_prefix('"') {
            let end = after_quote
                .find('"')
                .ok_or(CommandError::UnterminatedQuote)?;
            let value = &after_quote[..end];
            let remainder = &after_quote[end + 1..];
            if remainder.chars().next().is_some_and(|c| !c.is_whitespace()) {
                return Err(CommandError::TrailingAfterQuote);
            }
            self.rest = remainder;
            return Ok(Some(Token::Quoted(value)));
        }

        let end = self
            .rest
            .find(char::is_whitespace)
            .unwrap_or(self.rest.len());
        let value = &self.rest[..end];
        self.rest = &self.rest[end..];
        Ok(Some(Token::Bare(value)))
    }

    fn path(&mut self, keyword: &'static str, field: &'static str) -> Result<String, CommandError> {
        match self.next_token()? {
            Some(Token::Quoted(value)) | Some(Token::Bare(value)) => {
                if value.is_empty() {
                    Err(CommandError::EmptyPath)
                } else {
                    Ok(value.to_string())
                }
            }
            None => Err(CommandError::MissingArgument { keyword, field }),
        }
    }

    fn size(&mut self, keyword: &'static str) -> Result<u64, CommandError> {
        match self.next_token()? {
            Some(Token::Bare(value)) => parse_size_line(value),
            Some(Token::Quoted(value)) => Err(CommandError::InvalidSize(value.to_string())),
            None => Err(CommandError::MissingArgument {
                keyword,
                field: "size",
            }),
        }
    }

    fn finish(&mut self, keyword: &'static str) -> Result<(), CommandError> {
        match self.next_token()? {
            None => Ok(()),
            Some(Token::Bare(token)) | Some(Token::Quoted(token)) => {
                Err(CommandError::UnexpectedArgument {
                    keyword,
                    token: token.to_string(),
                })
            }
        }
    }
}
