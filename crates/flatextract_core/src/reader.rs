// reader.rs: sliding input window over a chain of files
use log::{debug, info, trace};
use memchr::memchr;
use std::fs::File;
use std::io::{self, Read};
use std::process::{Child, Command, Stdio};

use crate::error::{FfeError, Result};

pub const STDIN_NAME: &str = "(stdin)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Text,
    Binary,
}

struct Source {
    input: Box<dyn Read>,
    child: Option<Child>,
}

impl Source {
    fn close(self, name: &str) {
        let Source { input, child } = self;
        drop(input);
        if let Some(mut child) = child {
            match child.wait() {
                Ok(status) if !status.success() => debug!("Preprocessor for '{}' exited with {}", name, status),
                Ok(_) => {}
                Err(e) => debug!("Could not reap preprocessor for '{}': {}", name, e),
            }
        }
    }
}

/// Bounded-memory reader yielding lines or binary blocks from several files in turn.
///
/// `-` stands for standard input. The bytes of a returned unit are consumed when the
/// next unit is requested, by the amount given to `report_consumed` or the whole unit
/// otherwise.
pub struct StreamReader {
    files: Vec<String>,
    next_file: usize,
    source: Option<Source>,
    preprocessor: Option<String>,
    window: Vec<u8>,
    start: usize,
    end: usize,
    eof: bool,
    block_len: usize,
    pending: usize,
    file_name: String,
    file_line: u64,
    global_line: u64,
    file_offset: u64,
    global_offset: u64,
}

impl StreamReader {
    pub fn open(files: Vec<String>, capacity: usize, block_len: usize, preprocessor: Option<String>) -> Self {
        let capacity = capacity.max(block_len).max(1);
        let files = if files.is_empty() { vec!["-".to_string()] } else { files };
        StreamReader {
            files,
            next_file: 0,
            source: None,
            preprocessor,
            window: vec![0u8; capacity],
            start: 0,
            end: 0,
            eof: true,
            block_len: block_len.max(1),
            pending: 0,
            file_name: String::new(),
            file_line: 0,
            global_line: 0,
            file_offset: 0,
            global_offset: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.window.len()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Line number of the last text unit within its file, 1-based.
    pub fn file_line(&self) -> u64 {
        self.file_line
    }

    pub fn global_line(&self) -> u64 {
        self.global_line
    }

    /// Byte offset of the last unit within its file.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    pub fn global_offset(&self) -> u64 {
        self.global_offset
    }

    /// Set how many bytes of the last unit were used; the rest is read again.
    pub fn report_consumed(&mut self, n: usize) {
        self.pending = n.min(self.end - self.start);
    }

    /// Next line (without its LF) or binary block, `None` after the last file.
    pub fn next_unit(&mut self, mode: Mode) -> Result<Option<&[u8]>> {
        self.consume_pending();
        loop {
            let avail = self.end - self.start;
            match mode {
                Mode::Text => {
                    if let Some(k) = memchr(b'\n', &self.window[self.start..self.end]) {
                        return Ok(Some(self.emit_line(k, k + 1)));
                    }
                    if !self.eof {
                        if avail == self.window.len() {
                            return Err(FfeError::BufferExhausted { capacity: self.window.len() });
                        }
                        self.refill()?;
                        continue;
                    }
                    if avail > 0 {
                        // last line without a terminator
                        return Ok(Some(self.emit_line(avail, avail)));
                    }
                }
                Mode::Binary => {
                    if avail < self.block_len && !self.eof {
                        self.refill()?;
                        continue;
                    }
                    if avail > 0 {
                        let n = avail.min(self.block_len);
                        self.pending = n;
                        return Ok(Some(&self.window[self.start..self.start + n]));
                    }
                }
            }
            if !self.open_next()? {
                return Ok(None);
            }
        }
    }

    /// Look at the next block without consuming any of it.
    pub fn peek_block(&mut self) -> Result<Option<&[u8]>> {
        self.consume_pending();
        let found = self.next_unit(Mode::Binary)?.is_some();
        self.pending = 0;
        if !found {
            return Ok(None);
        }
        let n = (self.end - self.start).min(self.block_len);
        Ok(Some(&self.window[self.start..self.start + n]))
    }

    fn emit_line(&mut self, len: usize, consume: usize) -> &[u8] {
        self.file_line += 1;
        self.global_line += 1;
        self.pending = consume;
        &self.window[self.start..self.start + len]
    }

    fn consume_pending(&mut self) {
        if self.pending == 0 {
            return;
        }
        self.start += self.pending;
        self.file_offset += self.pending as u64;
        self.global_offset += self.pending as u64;
        self.pending = 0;
    }

    fn refill(&mut self) -> Result<()> {
        if self.start > 0 {
            self.window.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let Some(source) = self.source.as_mut() else {
            self.eof = true;
            return Ok(());
        };
        loop {
            match source.input.read(&mut self.window[self.end..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => {
                    self.end += n;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        trace!("Window refilled for '{}': {} bytes buffered", self.file_name, self.end);
        Ok(())
    }

    fn close_current(&mut self) {
        if let Some(source) = self.source.take() {
            source.close(&self.file_name);
        }
    }

    fn open_next(&mut self) -> Result<bool> {
        self.close_current();
        let Some(name) = self.files.get(self.next_file).cloned() else {
            return Ok(false);
        };
        self.next_file += 1;
        self.start = 0;
        self.end = 0;
        self.pending = 0;
        self.eof = false;
        self.file_line = 0;
        self.file_offset = 0;

        if name == "-" {
            self.file_name = STDIN_NAME.to_string();
            self.source = Some(Source { input: Box::new(io::stdin()), child: None });
        } else {
            self.file_name = name.clone();
            self.source = Some(self.open_source(&name)?);
            if self.preprocessor.is_some() {
                self.refill()?;
                if self.end == 0 {
                    // preprocessor had nothing to say about this file
                    self.close_current();
                    self.eof = false;
                    self.source = Some(open_file(&name)?);
                }
            }
        }
        info!("Reading input file '{}'", self.file_name);
        Ok(true)
    }

    fn open_source(&self, name: &str) -> Result<Source> {
        let Some(template) = self.preprocessor.as_deref() else {
            return open_file(name);
        };
        let command = template.replace("%s", name);
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| FfeError::Process { command: command.clone(), reason: e.to_string() })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FfeError::Process { command, reason: "stdout not captured".to_string() })?;
        Ok(Source { input: Box::new(stdout), child: Some(child) })
    }
}

fn open_file(name: &str) -> Result<Source> {
    let file = File::open(name)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {}", name, e)))?;
    Ok(Source { input: Box::new(file), child: None })
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.close_current();
    }
}
