//! Store-record contract and the shared vocabulary (headers, flags, status)
//! used by the mail adapter.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use log::warn;
use serde::{Deserialize, Serialize};

pub const SEEN_FLAG: &str = "\\Seen";
pub const ANSWERED_FLAG: &str = "\\Answered";
pub const FLAGGED_FLAG: &str = "\\Flagged";
pub const DELETED_FLAG: &str = "\\Deleted";
pub const DRAFT_FLAG: &str = "\\Draft";
pub const RECENT_FLAG: &str = "\\Recent";

/// A header value as stored in a header document: either a plain string or
/// an ordered list (recipients, tags).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Text(String),
    List(Vec<String>),
}

impl HeaderValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(text) => Some(text),
            HeaderValue::List(_) => None,
        }
    }

    /// Entries of the value; a non-empty text counts as a single entry.
    pub fn values(&self) -> Vec<String> {
        match self {
            HeaderValue::Text(text) if text.is_empty() => Vec::new(),
            HeaderValue::Text(text) => vec![text.clone()],
            HeaderValue::List(items) => items.clone(),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(s: &str) -> Self {
        HeaderValue::Text(s.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(s: String) -> Self {
        HeaderValue::Text(s)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(items: Vec<String>) -> Self {
        HeaderValue::List(items)
    }
}

pub type HeaderMap = BTreeMap<String, HeaderValue>;

/// How `StoreRecord::set_flags` combines the given flags with the current set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FlagMode {
    Remove = -1,
    Replace = 0,
    Add = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Read,
    Replied,
    Flagged,
    Deleted,
    Draft,
    Recent,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Read,
        Status::Replied,
        Status::Flagged,
        Status::Deleted,
        Status::Draft,
        Status::Recent,
    ];

    /// Stable symbolic name, as exposed to display and transport layers.
    pub fn name(self) -> &'static str {
        match self {
            Status::Read => "read",
            Status::Replied => "replied",
            Status::Flagged => "flagged",
            Status::Deleted => "deleted",
            Status::Draft => "draft",
            Status::Recent => "recent",
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            Status::Read => SEEN_FLAG,
            Status::Replied => ANSWERED_FLAG,
            Status::Flagged => FLAGGED_FLAG,
            Status::Deleted => DELETED_FLAG,
            Status::Draft => DRAFT_FLAG,
            Status::Recent => RECENT_FLAG,
        }
    }

    pub fn from_flag(flag: &str) -> Option<Status> {
        Status::ALL
            .into_iter()
            .find(|status| status.flag().eq_ignore_ascii_case(flag))
    }

    pub fn from_name(name: &str) -> Option<Status> {
        Status::ALL.into_iter().find(|status| status.name() == name)
    }

    /// Maps store flags to statuses. Flags without a status (keywords,
    /// server-specific flags) are skipped.
    pub fn from_flags<'a, I>(flags: I) -> HashSet<Status>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = HashSet::new();
        for flag in flags {
            match Status::from_flag(flag) {
                Some(status) => {
                    out.insert(status);
                }
                None => warn!("ignoring store flag without status: {}", flag),
            }
        }
        out
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of a mail: mailbox name plus the per-mailbox sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailIdent(String);

impl MailIdent {
    pub fn new(mailbox: &str, sequence: u32) -> Self {
        Self(format!("{}-{}", mailbox, sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MailIdent {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MailIdent {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for MailIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the adapter needs from a persisted mail record. Calls are blocking
/// and either complete or fail; the implementor owns retries and timeouts.
pub trait StoreRecord: Send {
    /// Raw textual body.
    fn body_content(&self) -> Result<String>;

    /// Header document as stored (header names keep their stored casing).
    fn headers(&self) -> Result<HeaderMap>;

    fn flags(&self) -> Result<Vec<String>>;

    fn set_flags(&mut self, flags: &[&str], mode: FlagMode) -> Result<()>;

    fn mailbox_name(&self) -> &str;

    fn sequence_number(&self) -> u32;

    /// Replaces the stored header document.
    fn write_header_document(&mut self, headers: HeaderMap) -> Result<()>;
}

#[derive(Debug, Default)]
struct RecordState {
    headers: HeaderMap,
    body: String,
    flags: BTreeSet<String>,
    header_writes: usize,
    fail_writes: bool,
}

/// In-memory store record. Clones share the same underlying document, so a
/// caller can keep a handle and observe write-back.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    mailbox: String,
    sequence: u32,
    collection: Option<String>,
    state: Arc<Mutex<RecordState>>,
}

impl MemoryRecord {
    pub fn new(mailbox: impl Into<String>, sequence: u32, collection: Option<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            sequence,
            collection,
            state: Arc::new(Mutex::new(RecordState::default())),
        }
    }

    pub fn with_header(self, name: &str, value: impl Into<HeaderValue>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.headers.insert(name.to_string(), value.into());
        }
        self
    }

    pub fn with_body(self, body: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.body = body.into();
        }
        self
    }

    pub fn with_flags(self, flags: &[&str]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.flags = flags.iter().map(|f| f.to_string()).collect();
        }
        self
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    /// Makes every subsequent write fail, to exercise caller error paths.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_writes = fail;
        }
    }

    pub fn header_writes(&self) -> usize {
        self.state.lock().map(|s| s.header_writes).unwrap_or(0)
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, RecordState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("record state poisoned"))
    }
}

impl StoreRecord for MemoryRecord {
    fn body_content(&self) -> Result<String> {
        Ok(self.state()?.body.clone())
    }

    fn headers(&self) -> Result<HeaderMap> {
        Ok(self.state()?.headers.clone())
    }

    fn flags(&self) -> Result<Vec<String>> {
        Ok(self.state()?.flags.iter().cloned().collect())
    }

    fn set_flags(&mut self, flags: &[&str], mode: FlagMode) -> Result<()> {
        let mut state = self.state()?;
        if state.fail_writes {
            return Err(anyhow!(
                "flag write rejected for {}-{}",
                self.mailbox,
                self.sequence
            ));
        }
        match mode {
            FlagMode::Add => {
                state.flags.extend(flags.iter().map(|f| f.to_string()));
            }
            FlagMode::Remove => {
                for flag in flags {
                    state.flags.remove(*flag);
                }
            }
            FlagMode::Replace => {
                state.flags = flags.iter().map(|f| f.to_string()).collect();
            }
        }
        Ok(())
    }

    fn mailbox_name(&self) -> &str {
        &self.mailbox
    }

    fn sequence_number(&self) -> u32 {
        self.sequence
    }

    fn write_header_document(&mut self, headers: HeaderMap) -> Result<()> {
        let mut state = self.state()?;
        if state.fail_writes {
            return Err(anyhow!(
                "header document write rejected for {}-{}",
                self.mailbox,
                self.sequence
            ));
        }
        state.headers = headers;
        state.header_writes += 1;
        Ok(())
    }
}
