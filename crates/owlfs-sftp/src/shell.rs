//! Shell command emulator
//!
//! Some clients probe the server over exec channels for checksums and free
//! space before or after a transfer. This module answers that small
//! vocabulary from the VFS; anything else fails with a non-zero status.
//! It never spawns processes.

use owlfs_core::{HashKind, Usage, Vfs, VfsPath, digest};
use std::sync::Arc;
use tracing::debug;

/// Exit status of a successful command
pub const EXIT_SUCCESS: u32 = 0;

/// Exit status of a failed or unknown command
pub const EXIT_FAILURE: u32 = 1;

/// Result of one command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: u32,
}

impl ShellOutput {
    fn success(stdout: String) -> Self {
        Self {
            stdout,
            stderr: String::new(),
            exit_status: EXIT_SUCCESS,
        }
    }

    fn failure(stderr: String) -> Self {
        Self {
            stdout: String::new(),
            stderr,
            exit_status: EXIT_FAILURE,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == EXIT_SUCCESS
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Hash { kind: HashKind, paths: Vec<String> },
    Df,
}

/// Answers checksum and disk-free queries against a VFS
#[derive(Clone)]
pub struct ShellEmulator {
    vfs: Arc<dyn Vfs>,
}

impl ShellEmulator {
    pub fn new(vfs: Arc<dyn Vfs>) -> Self {
        Self { vfs }
    }

    /// Run one command line
    pub async fn execute(&self, line: &str) -> ShellOutput {
        let command = match parse_command(line) {
            Ok(command) => command,
            Err(message) => {
                debug!(command = %line, reason = %message, "Rejected shell command");
                return ShellOutput::failure(format!("{message}\n"));
            }
        };

        match command {
            Command::Hash { kind, paths } => self.hash(kind, &paths).await,
            Command::Df => self.df().await,
        }
    }

    async fn hash(&self, kind: HashKind, paths: &[String]) -> ShellOutput {
        let program = hash_program(kind);
        if paths.is_empty() {
            // Clients call the bare command to probe for support
            return ShellOutput::success(format!("{}  -\n", digest(kind, b"")));
        }

        let mut stdout = String::new();
        let mut stderr = String::new();
        for raw in paths {
            let result = match VfsPath::parse(raw) {
                Ok(path) => self.vfs.checksum(&path, kind).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match result {
                Ok(hex) => stdout.push_str(&format!("{hex}  {raw}\n")),
                Err(message) => stderr.push_str(&format!("{program}: {raw}: {message}\n")),
            }
        }

        ShellOutput {
            exit_status: if stderr.is_empty() {
                EXIT_SUCCESS
            } else {
                EXIT_FAILURE
            },
            stdout,
            stderr,
        }
    }

    async fn df(&self) -> ShellOutput {
        match self.vfs.usage().await {
            Ok(usage) => match format_df(&usage) {
                Some(table) => ShellOutput::success(table),
                None => ShellOutput::failure("df: usage information incomplete\n".to_string()),
            },
            Err(e) => ShellOutput::failure(format!("df: {e}\n")),
        }
    }
}

fn hash_program(kind: HashKind) -> &'static str {
    match kind {
        HashKind::Md5 => "md5sum",
        HashKind::Sha1 => "sha1sum",
        HashKind::Sha256 => "sha256sum",
    }
}

fn parse_command(line: &str) -> Result<Command, String> {
    let words = split_words(line)?;
    let Some((program, args)) = words.split_first() else {
        return Err("empty command".to_string());
    };

    match program.as_str() {
        "md5sum" => Ok(Command::Hash {
            kind: HashKind::Md5,
            paths: args.to_vec(),
        }),
        "sha1sum" => Ok(Command::Hash {
            kind: HashKind::Sha1,
            paths: args.to_vec(),
        }),
        "sha256sum" => Ok(Command::Hash {
            kind: HashKind::Sha256,
            paths: args.to_vec(),
        }),
        "df" => match args {
            [] => Ok(Command::Df),
            [flag] if flag == "-k" => Ok(Command::Df),
            [flag, ..] => Err(format!("df: unsupported option {flag}")),
        },
        other => Err(format!("{other}: command not found")),
    }
}

/// Split a command line into words, undoing shell quoting and escapes
fn split_words(line: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(escaped) => word.push(escaped),
                    None => return Err("trailing backslash".to_string()),
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err("unterminated quote".to_string()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err("unterminated quote".to_string()),
                        },
                        Some(c) => word.push(c),
                        None => return Err("unterminated quote".to_string()),
                    }
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// POSIX `df -k` table with a single `owlfs` row
fn format_df(usage: &Usage) -> Option<String> {
    let (total, used, free) = match (usage.total, usage.used, usage.free) {
        (Some(total), Some(used), Some(free)) => (total, used, free),
        (Some(total), Some(used), None) => (total, used, total.saturating_sub(used)),
        (Some(total), None, Some(free)) => (total, total.saturating_sub(free), free),
        (None, Some(used), Some(free)) => (used.saturating_add(free), used, free),
        _ => return None,
    };

    let blocks = |bytes: u64| bytes.div_ceil(1024);
    let percent = if total == 0 {
        "-".to_string()
    } else {
        format!("{}%", (u128::from(used) * 100).div_ceil(u128::from(total)))
    };

    Some(format!(
        "{:<14} {:>10} {:>10} {:>10} {:>4} {}\n{:<14} {:>10} {:>10} {:>10} {:>4} {}\n",
        "Filesystem",
        "1K-blocks",
        "Used",
        "Available",
        "Use%",
        "Mounted on",
        "owlfs",
        blocks(total),
        blocks(used),
        blocks(free),
        percent,
        "/"
    ))
}

/// Assembles interactive shell input into complete lines
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append channel data, returning every line it completes
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    /// Whatever was typed after the last newline
    pub fn finish(self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.pending).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_words_unescapes() {
        assert_eq!(
            split_words("md5sum 'my file.txt'").unwrap(),
            vec!["md5sum", "my file.txt"]
        );
        assert_eq!(
            split_words(r"sha1sum my\ file.txt").unwrap(),
            vec!["sha1sum", "my file.txt"]
        );
        assert_eq!(
            split_words(r#"md5sum "a \"quoted\" name" b"#).unwrap(),
            vec!["md5sum", "a \"quoted\" name", "b"]
        );
        assert_eq!(split_words("  df   -k ").unwrap(), vec!["df", "-k"]);
        assert_eq!(split_words("md5sum ''").unwrap(), vec!["md5sum", ""]);
        assert!(split_words("md5sum 'open").is_err());
        assert!(split_words("md5sum trailing\\").is_err());
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("sha256sum /a").unwrap(),
            Command::Hash {
                kind: HashKind::Sha256,
                paths: vec!["/a".to_string()]
            }
        );
        assert_eq!(parse_command("df").unwrap(), Command::Df);
        assert_eq!(parse_command("df -k").unwrap(), Command::Df);
        assert!(parse_command("df -h").is_err());
        assert!(parse_command("rm -rf /").is_err());
        assert!(parse_command("   ").is_err());
    }

    #[test]
    fn test_format_df() {
        let usage = Usage {
            total: Some(1024 * 1024),
            used: Some(1024 * 256),
            free: Some(1024 * 768),
        };
        let table = format_df(&usage).unwrap();
        let mut lines = table.lines();
        let header: Vec<&str> = lines.next().unwrap().split_whitespace().collect();
        assert_eq!(
            header,
            ["Filesystem", "1K-blocks", "Used", "Available", "Use%", "Mounted", "on"]
        );
        let row: Vec<&str> = lines.next().unwrap().split_whitespace().collect();
        assert_eq!(row, ["owlfs", "1024", "256", "768", "25%", "/"]);

        let partial = Usage {
            total: Some(2048),
            used: Some(1024),
            free: None,
        };
        assert!(format_df(&partial).unwrap().contains("50%"));
        assert!(format_df(&Usage::default()).is_none());
    }

    #[test]
    fn test_format_df_huge_store() {
        let usage = Usage {
            total: None,
            used: Some(u64::MAX),
            free: Some(u64::MAX),
        };
        let table = format_df(&usage).unwrap();
        let row: Vec<&str> = table.lines().nth(1).unwrap().split_whitespace().collect();
        assert_eq!(
            row,
            ["owlfs", "18014398509481984", "18014398509481984", "18014398509481984", "100%", "/"]
        );
    }

    #[test]
    fn test_line_buffer() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"md5").is_empty());
        assert_eq!(buffer.push(b"sum /a\r\ndf\n"), vec!["md5sum /a", "df"]);
        assert!(buffer.push(b"exit").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("exit"));
    }
}
