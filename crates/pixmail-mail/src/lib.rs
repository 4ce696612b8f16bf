//! Mail adapter: a normalized view over one store record, with write-back of
//! read status and tags, and MIME serialization for outbound delivery.

use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, FixedOffset};
use lettre::message::{Mailbox, Message, MessageBuilder, MultiPart, SinglePart};
use log::debug;
use pixmail_core::{
    FlagMode, HeaderMap, HeaderValue, MailIdent, SEEN_FLAG, Status, StoreRecord,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

mod date;

pub use date::{ParsedDate, local_now, normalize_date, parse_date};

const RECIPIENT_HEADERS: [&str; 3] = ["to", "cc", "bcc"];
const TAGS_HEADER: &str = "x-tags";
const STORED_TAGS_HEADER: &str = "X-Tags";

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail has neither a date nor a received header")]
    MissingDate,
    #[error("unparseable date: {value}")]
    InvalidDate { value: String },
    #[error("missing header: {0}")]
    MissingHeader(&'static str),
    #[error("mail is not backed by a store record")]
    Detached,
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("mime build failed: {0}")]
    Mime(#[from] lettre::error::Error),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Plain representation of a mail, used for drafts coming in and for
/// transport/display going out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailDict {
    pub header: HeaderMap,
    pub ident: Option<MailIdent>,
    pub tags: Vec<String>,
    pub status: Vec<Status>,
    pub security_casing: JsonMap<String, JsonValue>,
    pub body: String,
}

pub struct Mail {
    record: Option<Box<dyn StoreRecord>>,
    ident: Option<MailIdent>,
    headers: HeaderMap,
    body: String,
    date: String,
    tags: HashSet<String>,
    status: HashSet<Status>,
    security_casing: JsonMap<String, JsonValue>,
}

impl fmt::Debug for Mail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mail")
            .field("ident", &self.ident)
            .field("date", &self.date)
            .field("tags", &self.tags)
            .field("status", &self.status)
            .field("backed", &self.record.is_some())
            .finish()
    }
}

impl Mail {
    pub fn from_record<R>(record: R) -> Result<Self, MailError>
    where
        R: StoreRecord + 'static,
    {
        Self::from_record_with(record, normalize_date)
    }

    /// Builds the view with a caller-supplied date normalizer.
    pub fn from_record_with<R, F>(record: R, normalize: F) -> Result<Self, MailError>
    where
        R: StoreRecord + 'static,
        F: Fn(&str) -> Result<String, MailError>,
    {
        let body = record.body_content()?;
        let mut headers = extract_headers(record.headers()?);
        let date = header_date(&headers, &normalize)?;
        headers.insert("date".to_string(), HeaderValue::Text(date.clone()));
        let ident = MailIdent::new(record.mailbox_name(), record.sequence_number());
        let flags = record.flags()?;
        let status = Status::from_flags(flags.iter().map(String::as_str));
        let tags = headers.get(TAGS_HEADER).map(tag_set).unwrap_or_default();

        Ok(Self {
            record: Some(Box::new(record)),
            ident: Some(ident),
            headers,
            body,
            date,
            tags,
            status,
            security_casing: JsonMap::new(),
        })
    }

    /// Builds a draft. The `date` header is always replaced by the current
    /// time; any date supplied in `dict` is dropped.
    pub fn from_dict(dict: MailDict) -> Self {
        Self::from_dict_at(dict, local_now())
    }

    pub fn from_dict_at(dict: MailDict, now: DateTime<FixedOffset>) -> Self {
        let date = now.to_rfc3339();
        let mut headers = dict.header;
        headers.insert("date".to_string(), HeaderValue::Text(date.clone()));
        Self {
            record: None,
            ident: dict.ident,
            headers,
            body: dict.body,
            date,
            tags: dict.tags.into_iter().collect(),
            status: dict.status.into_iter().collect(),
            security_casing: dict.security_casing,
        }
    }

    pub fn ident(&self) -> Option<&MailIdent> {
        self.ident.as_ref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    pub fn status(&self) -> &HashSet<Status> {
        &self.status
    }

    pub fn security_casing(&self) -> &JsonMap<String, JsonValue> {
        &self.security_casing
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn set_from(&mut self, from: &str) {
        self.headers.insert(
            "from".to_string(),
            HeaderValue::List(vec![from.to_string()]),
        );
    }

    pub fn get_to(&self) -> Option<Vec<String>> {
        self.headers.get("to").map(HeaderValue::values)
    }

    pub fn get_cc(&self) -> Option<Vec<String>> {
        self.headers.get("cc").map(HeaderValue::values)
    }

    pub fn get_bcc(&self) -> Option<Vec<String>> {
        self.headers.get("bcc").map(HeaderValue::values)
    }

    /// Adds the seen flag on the record and re-reads status from the
    /// record's resulting flags.
    pub fn mark_as_read(&mut self) -> Result<&mut Self, MailError> {
        let record = self.record.as_mut().ok_or(MailError::Detached)?;
        record.set_flags(&[SEEN_FLAG], FlagMode::Add)?;
        let flags = record.flags()?;
        self.status = Status::from_flags(flags.iter().map(String::as_str));
        debug!("marked {:?} as read", self.ident);
        Ok(self)
    }

    /// Replaces the tag set and persists the full list. Returns
    /// `(added, removed)` relative to the previous tags. Nothing changes in
    /// memory if the store rejects the write.
    pub fn update_tags(
        &mut self,
        new_tags: HashSet<String>,
    ) -> Result<(HashSet<String>, HashSet<String>), MailError> {
        let record = self.record.as_mut().ok_or(MailError::Detached)?;
        let added: HashSet<String> = new_tags.difference(&self.tags).cloned().collect();
        let removed: HashSet<String> = self.tags.difference(&new_tags).cloned().collect();

        let stored = sorted(&new_tags);
        let mut document = record.headers()?;
        document.retain(|name, _| !name.eq_ignore_ascii_case(TAGS_HEADER));
        document.insert(
            STORED_TAGS_HEADER.to_string(),
            HeaderValue::List(stored.clone()),
        );
        record.write_header_document(document)?;
        debug!(
            "persisted {} tags for {:?} (+{} -{})",
            stored.len(),
            self.ident,
            added.len(),
            removed.len()
        );

        self.headers
            .insert(TAGS_HEADER.to_string(), HeaderValue::List(stored));
        self.tags = new_tags;
        Ok((added, removed))
    }

    /// Tags sorted lexicographically, statuses in `Status` declaration order.
    pub fn as_dict(&self) -> MailDict {
        let mut header = self.headers.clone();
        header.insert("date".to_string(), HeaderValue::Text(self.date.clone()));
        let mut status: Vec<Status> = self.status.iter().copied().collect();
        status.sort();
        MailDict {
            header,
            ident: self.ident.clone(),
            tags: sorted(&self.tags),
            status,
            security_casing: self.security_casing.clone(),
            body: self.body.clone(),
        }
    }

    pub fn to_mime_multipart(&self) -> Result<MimeMultipart, MailError> {
        let mut builder = Message::builder().keep_bcc();
        for addr in self.recipients("to")? {
            builder = builder.to(parse_mailbox(&addr)?);
        }
        for addr in self.recipients("cc")? {
            builder = builder.cc(parse_mailbox(&addr)?);
        }
        for addr in self.recipients("bcc")? {
            builder = builder.bcc(parse_mailbox(&addr)?);
        }
        let subject = self
            .header_text("subject")
            .ok_or(MailError::MissingHeader("subject"))?;
        let raw_date = self.header_text("date").unwrap_or_else(|| self.date.clone());
        let sent_at = parse_date(&raw_date)
            .and_then(|parsed| parsed.to_system_time())
            .ok_or(MailError::InvalidDate { value: raw_date })?;
        builder = builder.subject(subject).date(sent_at);

        let parts = MultiPart::mixed().singlepart(SinglePart::plain(self.body.clone()));
        Ok(MimeMultipart { builder, parts })
    }

    /// The exact text handed to an SMTP transport.
    pub fn to_smtp_format(&self, from: &str) -> Result<String, MailError> {
        let message = self.to_mime_multipart()?.with_from(from)?;
        Ok(String::from_utf8_lossy(&message.formatted()).into_owned())
    }

    fn recipients(&self, name: &'static str) -> Result<Vec<String>, MailError> {
        self.headers
            .get(name)
            .map(HeaderValue::values)
            .ok_or(MailError::MissingHeader(name))
    }

    fn header_text(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.values().into_iter().next())
    }
}

/// A multipart message with recipients, subject, date and the text part
/// staged; it becomes a complete message once a sender is set.
#[derive(Debug)]
pub struct MimeMultipart {
    builder: MessageBuilder,
    parts: MultiPart,
}

impl MimeMultipart {
    pub fn with_from(self, from: &str) -> Result<Message, MailError> {
        let message = self.builder.from(parse_mailbox(from)?).multipart(self.parts)?;
        Ok(message)
    }
}

fn extract_headers(raw: HeaderMap) -> HeaderMap {
    let mut headers: HeaderMap = raw
        .into_iter()
        .map(|(name, value)| (name.to_lowercase(), value))
        .collect();
    for name in RECIPIENT_HEADERS {
        let split = headers
            .get(name)
            .map(split_recipients)
            .unwrap_or_default();
        headers.insert(name.to_string(), HeaderValue::List(split));
    }
    headers
}

fn split_recipients(value: &HeaderValue) -> Vec<String> {
    let entries = match value {
        HeaderValue::Text(text) => text.split(',').map(str::to_string).collect(),
        HeaderValue::List(items) => items.clone(),
    };
    entries
        .into_iter()
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect()
}

fn tag_set(value: &HeaderValue) -> HashSet<String> {
    match value {
        HeaderValue::Text(text) => text
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect(),
        HeaderValue::List(items) => items.iter().cloned().collect(),
    }
}

fn header_date<F>(headers: &HeaderMap, normalize: &F) -> Result<String, MailError>
where
    F: Fn(&str) -> Result<String, MailError>,
{
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.values().into_iter().next())
            .filter(|text| !text.trim().is_empty())
    };
    if let Some(date) = first("date") {
        return normalize(&date);
    }
    let received = first("received").ok_or(MailError::MissingDate)?;
    let tail = received.rsplit(';').next().unwrap_or_default().trim();
    normalize(tail)
}

fn parse_mailbox(input: &str) -> Result<Mailbox, MailError> {
    Ok(input.trim().parse()?)
}

fn sorted(items: &HashSet<String>) -> Vec<String> {
    let mut out: Vec<String> = items.iter().cloned().collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::DateTime;
    use mailparse::MailHeaderMap;
    use pixmail_core::{HeaderValue, MemoryRecord, RECENT_FLAG, SEEN_FLAG, Status, StoreRecord};

    use super::{Mail, MailDict, MailError};

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn inbox_record() -> MemoryRecord {
        MemoryRecord::new("INBOX", 12, Some("inbox".to_string()))
            .with_header("To", "alice@example.org, bob@example.org")
            .with_header("Cc", "")
            .with_header("Bcc", "")
            .with_header("Subject", "quarterly report")
            .with_header("Date", "2020-01-01T10:00:00Z")
            .with_header("X-Tags", vec!["b".to_string(), "c".to_string()])
            .with_body("see attached")
            .with_flags(&[RECENT_FLAG])
    }

    #[test]
    fn recipients_are_split_and_trimmed() -> anyhow::Result<()> {
        let mail = Mail::from_record(inbox_record())?;
        assert_eq!(
            mail.get_to(),
            Some(vec!["alice@example.org".to_string(), "bob@example.org".to_string()])
        );
        assert_eq!(mail.get_cc(), Some(Vec::new()));
        assert_eq!(mail.get_bcc(), Some(Vec::new()));
        Ok(())
    }

    #[test]
    fn missing_recipient_headers_become_empty() -> anyhow::Result<()> {
        let record = MemoryRecord::new("INBOX", 1, None)
            .with_header("Date", "2020-01-01T10:00:00Z")
            .with_header("Subject", "hi");
        let mail = Mail::from_record(record)?;
        assert_eq!(mail.get_cc(), Some(Vec::new()));
        assert_eq!(mail.get_bcc(), Some(Vec::new()));
        Ok(())
    }

    #[test]
    fn construction_normalizes_headers_and_identity() -> anyhow::Result<()> {
        let mail = Mail::from_record(inbox_record())?;
        assert_eq!(mail.date(), "2020-01-01T10:00:00+00:00");
        assert_eq!(
            mail.headers().get("date"),
            Some(&HeaderValue::Text("2020-01-01T10:00:00+00:00".to_string()))
        );
        assert!(mail.headers().contains_key("subject"));
        assert!(!mail.headers().contains_key("Subject"));
        assert_eq!(mail.ident().map(|id| id.as_str()), Some("INBOX-12"));
        assert_eq!(mail.tags(), &set(&["b", "c"]));
        assert!(mail.has_tag("b"));
        assert!(!mail.has_tag("a"));
        assert_eq!(mail.status(), &HashSet::from([Status::Recent]));
        assert!(mail.security_casing().is_empty());
        assert_eq!(mail.body(), "see attached");
        Ok(())
    }

    #[test]
    fn date_falls_back_to_received_tail() -> anyhow::Result<()> {
        let record = MemoryRecord::new("INBOX", 2, None)
            .with_header("Received", "by x; Wed, 01 Jan 2020 10:00:00 +0000");
        let mail = Mail::from_record(record)?;
        assert_eq!(mail.date(), "2020-01-01T10:00:00+00:00");
        Ok(())
    }

    #[test]
    fn missing_date_and_received_is_an_error() {
        let record = MemoryRecord::new("INBOX", 3, None).with_header("Subject", "undated");
        let err = Mail::from_record(record).unwrap_err();
        assert!(matches!(err, MailError::MissingDate));
    }

    #[test]
    fn unparseable_date_is_an_error() {
        let record = MemoryRecord::new("INBOX", 4, None).with_header("Date", "   ");
        assert!(matches!(
            Mail::from_record(record).unwrap_err(),
            MailError::MissingDate
        ));

        let record = MemoryRecord::new("INBOX", 5, None).with_header("Date", "soon");
        let err = Mail::from_record_with(record, |raw| {
            Err(MailError::InvalidDate {
                value: raw.to_string(),
            })
        })
        .unwrap_err();
        assert!(matches!(err, MailError::InvalidDate { value } if value == "soon"));
    }

    #[test]
    fn injected_normalizer_is_used() -> anyhow::Result<()> {
        let mail = Mail::from_record_with(inbox_record(), |raw| Ok(format!("seen:{}", raw)))?;
        assert_eq!(mail.date(), "seen:2020-01-01T10:00:00Z");
        Ok(())
    }

    #[test]
    fn update_tags_reports_diff_and_persists_full_list() -> anyhow::Result<()> {
        let handle = inbox_record();
        let mut mail = Mail::from_record(handle.clone())?;

        let (added, removed) = mail.update_tags(set(&["a", "b"]))?;
        assert_eq!(added, set(&["a"]));
        assert_eq!(removed, set(&["c"]));
        assert_eq!(mail.tags(), &set(&["a", "b"]));

        let stored = handle.headers()?;
        assert_eq!(
            stored.get("X-Tags"),
            Some(&HeaderValue::List(vec!["a".to_string(), "b".to_string()]))
        );
        assert_eq!(
            stored.get("Subject"),
            Some(&HeaderValue::from("quarterly report"))
        );
        assert_eq!(handle.header_writes(), 1);
        assert_eq!(mail.as_dict().tags, vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn failed_tag_write_keeps_previous_tags() -> anyhow::Result<()> {
        let handle = inbox_record();
        let mut mail = Mail::from_record(handle.clone())?;
        handle.fail_writes(true);

        let err = mail.update_tags(set(&["z"])).unwrap_err();
        assert!(matches!(err, MailError::Store(_)));
        assert_eq!(mail.tags(), &set(&["b", "c"]));
        assert_eq!(handle.header_writes(), 0);
        Ok(())
    }

    #[test]
    fn failed_flag_write_keeps_previous_status() -> anyhow::Result<()> {
        let handle = inbox_record();
        let mut mail = Mail::from_record(handle.clone())?;
        handle.fail_writes(true);

        let err = mail.mark_as_read().unwrap_err();
        assert!(matches!(err, MailError::Store(_)));
        assert_eq!(mail.status(), &HashSet::from([Status::Recent]));
        assert!(!handle.flags()?.contains(&SEEN_FLAG.to_string()));
        Ok(())
    }

    #[test]
    fn draft_uses_local_now_for_date() {
        let before = super::local_now();
        let mail = Mail::from_dict(MailDict::default());
        let stamped = DateTime::parse_from_rfc3339(mail.date()).expect("rfc3339 draft date");
        assert!(stamped.timestamp() >= before.timestamp());
    }

    #[test]
    fn mark_as_read_is_idempotent() -> anyhow::Result<()> {
        let handle = inbox_record();
        let mut mail = Mail::from_record(handle.clone())?;

        let once = mail.mark_as_read()?.status().clone();
        let twice = mail.mark_as_read()?.status().clone();
        assert_eq!(once, twice);
        assert!(twice.contains(&Status::Read));
        assert!(twice.contains(&Status::Recent));
        assert!(handle.flags()?.contains(&SEEN_FLAG.to_string()));
        Ok(())
    }

    #[test]
    fn drafts_cannot_write_back() {
        let mut draft = Mail::from_dict(MailDict::default());
        assert!(matches!(draft.mark_as_read(), Err(MailError::Detached)));
        assert!(matches!(
            draft.update_tags(set(&["x"])),
            Err(MailError::Detached)
        ));
    }

    #[test]
    fn draft_round_trips_and_gets_a_fresh_date() -> anyhow::Result<()> {
        let input = serde_json::json!({
            "header": {"subject": "hi", "date": "1999-12-31T23:59:59+00:00"},
            "body": "hello",
            "tags": ["x"],
        });
        let now = DateTime::parse_from_rfc3339("2024-05-06T07:08:09+02:00")?;
        let mail = Mail::from_dict_at(serde_json::from_value(input)?, now);
        let dict = mail.as_dict();

        assert_eq!(dict.body, "hello");
        assert_eq!(dict.tags, vec!["x".to_string()]);
        assert_eq!(dict.ident, None);
        assert_eq!(
            dict.header.get("date"),
            Some(&HeaderValue::from("2024-05-06T07:08:09+02:00"))
        );
        assert_eq!(dict.header.get("subject"), Some(&HeaderValue::from("hi")));

        let fresh = Mail::from_dict(dict.clone());
        assert_ne!(fresh.date(), "1999-12-31T23:59:59+00:00");
        Ok(())
    }

    #[test]
    fn as_dict_serializes_status_names_in_stable_order() -> anyhow::Result<()> {
        let handle = inbox_record().with_flags(&[RECENT_FLAG, SEEN_FLAG, "\\Answered"]);
        let mail = Mail::from_record(handle)?;
        let value = serde_json::to_value(mail.as_dict())?;
        assert_eq!(value["status"], serde_json::json!(["read", "replied", "recent"]));
        assert_eq!(value["ident"], serde_json::json!("INBOX-12"));
        assert_eq!(value["header"]["date"], "2020-01-01T10:00:00+00:00");
        assert_eq!(value["security_casing"], serde_json::json!({}));
        Ok(())
    }

    #[test]
    fn set_from_replaces_sender() {
        let mut mail = Mail::from_dict(MailDict::default());
        mail.set_from("me@example.org");
        assert_eq!(
            mail.headers().get("from"),
            Some(&HeaderValue::List(vec!["me@example.org".to_string()]))
        );
    }

    fn outbound_draft() -> anyhow::Result<Mail> {
        let input = serde_json::json!({
            "header": {
                "to": ["alice@example.org"],
                "cc": [],
                "bcc": [],
                "subject": "hi",
            },
            "body": "hello",
        });
        let now = DateTime::parse_from_rfc3339("2020-01-01T10:00:00+00:00")?;
        Ok(Mail::from_dict_at(serde_json::from_value(input)?, now))
    }

    #[test]
    fn smtp_format_carries_headers_and_text_part() -> anyhow::Result<()> {
        let wire = outbound_draft()?.to_smtp_format("me@example.org")?;
        let parsed = mailparse::parse_mail(wire.as_bytes())?;

        assert_eq!(
            parsed.headers.get_first_value("From").as_deref(),
            Some("me@example.org")
        );
        assert_eq!(
            parsed.headers.get_first_value("To").as_deref(),
            Some("alice@example.org")
        );
        assert_eq!(parsed.headers.get_first_value("Subject").as_deref(), Some("hi"));
        let date = parsed.headers.get_first_value("Date").unwrap_or_default();
        assert_eq!(mailparse::dateparse(&date)?, 1_577_872_800);
        assert!(parsed.ctype.mimetype.starts_with("multipart/"));

        assert_eq!(parsed.subparts.len(), 1);
        let part = &parsed.subparts[0];
        assert_eq!(part.ctype.mimetype, "text/plain");
        assert_eq!(part.get_body()?.trim_end(), "hello");
        Ok(())
    }

    #[test]
    fn smtp_format_joins_recipient_lists() -> anyhow::Result<()> {
        let record = inbox_record().with_header("Bcc", "carol@example.org");
        let wire = Mail::from_record(record)?.to_smtp_format("me@example.org")?;
        let parsed = mailparse::parse_mail(wire.as_bytes())?;

        let to = parsed.headers.get_first_value("To").unwrap_or_default();
        assert!(to.contains("alice@example.org"));
        assert!(to.contains("bob@example.org"));
        assert!(to.contains(", "));
        assert_eq!(
            parsed.headers.get_first_value("Bcc").as_deref(),
            Some("carol@example.org")
        );
        assert_eq!(parsed.subparts[0].get_body()?.trim_end(), "see attached");
        Ok(())
    }

    #[test]
    fn empty_recipient_lists_are_left_off_the_wire() -> anyhow::Result<()> {
        let wire = outbound_draft()?.to_smtp_format("me@example.org")?;
        let parsed = mailparse::parse_mail(wire.as_bytes())?;
        assert_eq!(parsed.headers.get_first_value("Cc"), None);
        assert_eq!(parsed.headers.get_first_value("Bcc"), None);

        let input = serde_json::json!({
            "header": {"to": [], "cc": [], "bcc": [], "subject": "nobody"},
        });
        let mail = Mail::from_dict(serde_json::from_value(input)?);
        let err = mail.to_smtp_format("me@example.org").unwrap_err();
        assert!(matches!(err, MailError::Mime(_)));
        Ok(())
    }

    #[test]
    fn mime_requires_recipient_keys() {
        let mail = Mail::from_dict(MailDict::default());
        let err = mail.to_mime_multipart().unwrap_err();
        assert!(matches!(err, MailError::MissingHeader("to")));
    }

    #[test]
    fn invalid_sender_is_rejected() -> anyhow::Result<()> {
        let err = outbound_draft()?.to_smtp_format("not an address").unwrap_err();
        assert!(matches!(err, MailError::Address(_)));
        Ok(())
    }
}
