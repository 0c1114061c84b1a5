//! Recorded message streams.
//!
//! The harness only needs to list a log's topics, iterate its messages and
//! write a reduced copy, so the log format sits behind [`MessageLogFormat`].
//! The built-in format is JSON lines: one tagged record per line, channel
//! declarations before the messages that use them.

use crate::errors::ReplayError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub topic: String,
    pub message_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub timestamp_ns: u64,
    pub data: Value,
}

pub trait LogReader {
    fn channels(&self) -> &[ChannelInfo];
    fn next_message(&mut self) -> Result<Option<Message>, ReplayError>;
}

pub trait LogWriter {
    fn write_channel(&mut self, channel: &ChannelInfo) -> Result<(), ReplayError>;
    fn write_message(&mut self, message: &Message) -> Result<(), ReplayError>;
    fn finish(self: Box<Self>) -> Result<(), ReplayError>;
}

pub trait MessageLogFormat: Send + Sync {
    fn payload_extension(&self) -> &str;
    fn open_reader(&self, path: &Path) -> Result<Box<dyn LogReader>, ReplayError>;
    fn create_writer(&self, path: &Path) -> Result<Box<dyn LogWriter>, ReplayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Keep only the listed topics.
    #[default]
    RetainExpected,
    /// Keep everything except the listed topics.
    DropExpected,
}

impl FilterMode {
    fn keeps(self, topics: &BTreeSet<String>, topic: &str) -> bool {
        match self {
            Self::RetainExpected => topics.contains(topic),
            Self::DropExpected => !topics.contains(topic),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Record {
    Channel {
        topic: String,
        message_type: String,
    },
    Message {
        topic: String,
        timestamp_ns: u64,
        data: Value,
    },
}

#[derive(Debug, Clone)]
pub struct JsonlFormat {
    extension: String,
}

impl JsonlFormat {
    pub fn new(extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
        }
    }
}

impl Default for JsonlFormat {
    fn default() -> Self {
        Self::new("jsonl")
    }
}

impl MessageLogFormat for JsonlFormat {
    fn payload_extension(&self) -> &str {
        &self.extension
    }

    fn open_reader(&self, path: &Path) -> Result<Box<dyn LogReader>, ReplayError> {
        Ok(Box::new(JsonlReader::open(path)?))
    }

    fn create_writer(&self, path: &Path) -> Result<Box<dyn LogWriter>, ReplayError> {
        Ok(Box::new(JsonlWriter::create(path)?))
    }
}

pub struct JsonlReader {
    path: String,
    channels: Vec<ChannelInfo>,
    declared: BTreeSet<String>,
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
}

impl JsonlReader {
    pub fn open(path: &Path) -> Result<Self, ReplayError> {
        let display = path.display().to_string();
        let mut channels = Vec::new();
        let mut declared = BTreeSet::new();

        // Channels may be declared after earlier messages; collect them first.
        for (index, line) in open_lines(path)?.enumerate() {
            let line = line.map_err(|e| ReplayError::MessageLog(format!("{display}: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Record::Channel {
                topic,
                message_type,
            } = parse_record(&display, index + 1, &line)?
            {
                if declared.insert(topic.clone()) {
                    channels.push(ChannelInfo {
                        topic,
                        message_type,
                    });
                }
            }
        }

        Ok(Self {
            path: display,
            channels,
            declared,
            lines: open_lines(path)?,
            line_no: 0,
        })
    }
}

impl LogReader for JsonlReader {
    fn channels(&self) -> &[ChannelInfo] {
        &self.channels
    }

    fn next_message(&mut self) -> Result<Option<Message>, ReplayError> {
        for line in self.lines.by_ref() {
            self.line_no += 1;
            let line =
                line.map_err(|e| ReplayError::MessageLog(format!("{}: {e}", self.path)))?;
            if line.trim().is_empty() {
                continue;
            }
            match parse_record(&self.path, self.line_no, &line)? {
                Record::Channel { .. } => continue,
                Record::Message {
                    topic,
                    timestamp_ns,
                    data,
                } => {
                    if !self.declared.contains(&topic) {
                        return Err(ReplayError::MessageLog(format!(
                            "{}:{}: message on undeclared topic `{topic}`",
                            self.path, self.line_no
                        )));
                    }
                    return Ok(Some(Message {
                        topic,
                        timestamp_ns,
                        data,
                    }));
                }
            }
        }
        Ok(None)
    }
}

pub struct JsonlWriter {
    path: String,
    out: BufWriter<File>,
    declared: BTreeSet<String>,
}

impl JsonlWriter {
    pub fn create(path: &Path) -> Result<Self, ReplayError> {
        let file = File::create(path)
            .map_err(|e| ReplayError::MessageLog(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path: path.display().to_string(),
            out: BufWriter::new(file),
            declared: BTreeSet::new(),
        })
    }

    fn write_record(&mut self, record: &Record) -> Result<(), ReplayError> {
        let line = serde_json::to_string(record)
            .map_err(|e| ReplayError::MessageLog(format!("{}: {e}", self.path)))?;
        self.out
            .write_all(line.as_bytes())
            .and_then(|_| self.out.write_all(b"\n"))
            .map_err(|e| ReplayError::MessageLog(format!("{}: {e}", self.path)))
    }
}

impl LogWriter for JsonlWriter {
    fn write_channel(&mut self, channel: &ChannelInfo) -> Result<(), ReplayError> {
        if !self.declared.insert(channel.topic.clone()) {
            return Ok(());
        }
        self.write_record(&Record::Channel {
            topic: channel.topic.clone(),
            message_type: channel.message_type.clone(),
        })
    }

    fn write_message(&mut self, message: &Message) -> Result<(), ReplayError> {
        if !self.declared.contains(&message.topic) {
            return Err(ReplayError::MessageLog(format!(
                "{}: message on undeclared topic `{}`",
                self.path, message.topic
            )));
        }
        self.write_record(&Record::Message {
            topic: message.topic.clone(),
            timestamp_ns: message.timestamp_ns,
            data: message.data.clone(),
        })
    }

    fn finish(mut self: Box<Self>) -> Result<(), ReplayError> {
        self.out
            .flush()
            .map_err(|e| ReplayError::MessageLog(format!("{}: {e}", self.path)))
    }
}

fn open_lines(path: &Path) -> Result<std::io::Lines<BufReader<File>>, ReplayError> {
    let file = File::open(path)
        .map_err(|e| ReplayError::MessageLog(format!("{}: {e}", path.display())))?;
    Ok(BufReader::new(file).lines())
}

fn parse_record(path: &str, line_no: usize, line: &str) -> Result<Record, ReplayError> {
    serde_json::from_str(line)
        .map_err(|e| ReplayError::MessageLog(format!("{path}:{line_no}: {e}")))
}

/// Iterates messages whose topic is in `topics`; an empty set yields all.
pub fn read_messages<'a>(
    reader: &'a mut dyn LogReader,
    topics: &'a BTreeSet<String>,
) -> impl Iterator<Item = Result<Message, ReplayError>> + 'a {
    std::iter::from_fn(move || loop {
        match reader.next_message() {
            Ok(Some(message)) if topics.is_empty() || topics.contains(&message.topic) => {
                return Some(Ok(message))
            }
            Ok(Some(_)) => continue,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        }
    })
}

pub fn list_topics(format: &dyn MessageLogFormat, path: &Path) -> Result<BTreeSet<String>, ReplayError> {
    let reader = format.open_reader(path)?;
    Ok(reader
        .channels()
        .iter()
        .map(|channel| channel.topic.clone())
        .collect())
}

/// Copies `input` to `output` keeping only the channels and messages that
/// `mode` selects from `topics`. Output depends only on the input bytes and
/// the topic set.
pub fn filter_log(
    format: &dyn MessageLogFormat,
    input: &Path,
    output: &Path,
    topics: &BTreeSet<String>,
    mode: FilterMode,
) -> Result<usize, ReplayError> {
    let mut reader = format.open_reader(input)?;
    let mut writer = format.create_writer(output)?;

    for channel in reader.channels() {
        if mode.keeps(topics, &channel.topic) {
            writer.write_channel(channel)?;
        }
    }

    let mut kept = 0;
    while let Some(message) = reader.next_message()? {
        if mode.keeps(topics, &message.topic) {
            writer.write_message(&message)?;
            kept += 1;
        }
    }
    writer.finish()?;
    Ok(kept)
}
