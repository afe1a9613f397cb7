//! Tag codec for steering messages.
//!
//! Messages are line-oriented, one tag per line:
//! ```text
//! message := "<ReG_steer_message>" body? "</ReG_steer_message>"
//! element := open element* close | leaf | empty
//! open    := "<" name ">"
//! close   := "</" name ">"
//! leaf    := "<" name ">" text "</" name ">"
//! empty   := "<" name "/>"
//! name    := [A-Za-z0-9_]+
//! ```
//! Leaf text escapes `&`, `<`, `>`, CR and LF as character references, so
//! every encoded line starts with `<` and none can collide with the framing
//! sentinel. Blank lines and leading indentation are ignored when decoding.

use std::str::FromStr;

use crate::error::{ProtoError, Result};
use crate::handle::Handle;
use crate::log::{LogKind, LogRecord};
use crate::message::{
    ChkDef, CommandArg, CommandDef, CommandInvocation, ControlMsg, IoDataMsg, IoDef, LogMsg,
    Message, MessageKind, ParamDef, ParamHistory, ParamUpdate, StatusMsg,
};
use crate::param::{ParamType, ParamValue};

const ROOT: &str = "ReG_steer_message";

fn body_tag(kind: MessageKind) -> Option<&'static str> {
    match kind {
        MessageKind::IoDefs => Some("IOType_defs"),
        MessageKind::ChkDefs => Some("ChkType_defs"),
        MessageKind::ParamDefs => Some("Param_defs"),
        MessageKind::SupportedCommands => Some("Supp_cmds"),
        MessageKind::Status => Some("App_status"),
        MessageKind::Control => Some("Steer_control"),
        MessageKind::Log => Some("Steer_log"),
        MessageKind::IoData => Some("IO_data"),
        MessageKind::Error => Some("Error_msg"),
        MessageKind::NotSet => None,
    }
}

/// Serialize a message to its text form (no trailing newline).
pub fn encode(message: &Message) -> String {
    let mut w = TagWriter::default();
    w.open(ROOT);
    match message {
        Message::IoDefs(defs) => {
            w.open("IOType_defs");
            for def in defs {
                w.open("IOType");
                w.leaf("Handle", &def.handle.to_string());
                w.leaf("Label", &def.label);
                w.leaf("Direction", def.direction.as_str());
                w.leaf("Frequency", &def.frequency.to_string());
                w.leaf("Freq_handle", &def.freq_handle.to_string());
                w.close("IOType");
            }
            w.close("IOType_defs");
        }
        Message::ChkDefs(defs) => {
            w.open("ChkType_defs");
            for def in defs {
                w.open("ChkType");
                w.leaf("Handle", &def.handle.to_string());
                w.leaf("Label", &def.label);
                w.leaf("Direction", def.direction.as_str());
                w.close("ChkType");
            }
            w.close("ChkType_defs");
        }
        Message::ParamDefs(defs) => {
            w.open("Param_defs");
            for def in defs {
                write_param_def(&mut w, def);
            }
            w.close("Param_defs");
        }
        Message::SupportedCommands(commands) => {
            w.open("Supp_cmds");
            for command in commands {
                w.open("Command");
                w.leaf("Cmd_id", &command.id.to_string());
                for param in &command.params {
                    write_param_def(&mut w, param);
                }
                w.close("Command");
            }
            w.close("Supp_cmds");
        }
        Message::Status(status) => {
            w.open("App_status");
            w.leaf("Seq_num", &status.seq_num.to_string());
            write_updates(&mut w, &status.params);
            write_invocations(&mut w, &status.commands);
            w.close("App_status");
        }
        Message::Control(control) => {
            w.open("Steer_control");
            write_updates(&mut w, &control.params);
            write_invocations(&mut w, &control.commands);
            w.close("Steer_control");
        }
        Message::Log(log) => {
            w.open("Steer_log");
            for record in &log.entries {
                w.open("Log_entry");
                w.leaf("Key", &record.key.to_string());
                match &record.kind {
                    LogKind::Checkpoint { chk_handle, tag } => {
                        w.leaf("Kind", "checkpoint");
                        w.leaf("Chk_handle", &chk_handle.to_string());
                        w.leaf("Chk_tag", tag);
                    }
                    LogKind::ParamSnapshot { seq_num } => {
                        w.leaf("Kind", "params");
                        w.leaf("Seq_num", &seq_num.to_string());
                    }
                }
                write_updates(&mut w, &record.params);
                w.close("Log_entry");
            }
            for history in &log.histories {
                w.open("Param_history");
                w.leaf("Handle", &history.handle.to_string());
                for value in &history.values {
                    w.leaf("Value", value);
                }
                w.close("Param_history");
            }
            w.close("Steer_log");
        }
        Message::IoData(block) => {
            w.open("IO_data");
            w.leaf("Handle", &block.handle.to_string());
            w.leaf("Seq_num", &block.seq_num.to_string());
            w.leaf("Data", &ParamValue::Bin(block.data.clone()).to_text());
            w.close("IO_data");
        }
        Message::Error(text) => w.leaf("Error_msg", text),
        Message::NotSet => {}
    }
    w.close(ROOT);
    w.finish()
}

/// Parse the text form of a message.
///
/// Fails with `Malformed` when the text breaks the grammar or a required
/// field is missing or unparsable, and `UnexpectedKind` for an unknown body.
pub fn decode(text: &str) -> Result<Message> {
    let root = parse_tree(text)?;
    if root.name != ROOT {
        return Err(ProtoError::malformed(
            root.line,
            format!("expected <{ROOT}>, found <{}>", root.name),
        ));
    }
    let body = match root.children.as_slice() {
        [] => return Ok(Message::NotSet),
        [body] => body,
        [_, extra, ..] => {
            return Err(ProtoError::malformed(
                extra.line,
                "more than one message body",
            ))
        }
    };

    match body.name.as_str() {
        "IOType_defs" => body
            .children_named("IOType")
            .map(|el| {
                Ok(IoDef {
                    handle: el.parse_leaf("Handle")?,
                    label: el.leaf("Label")?.to_string(),
                    direction: el.parse_leaf("Direction")?,
                    frequency: el.parse_leaf("Frequency")?,
                    freq_handle: el.parse_leaf("Freq_handle")?,
                })
            })
            .collect::<Result<_>>()
            .map(Message::IoDefs),
        "ChkType_defs" => body
            .children_named("ChkType")
            .map(|el| {
                Ok(ChkDef {
                    handle: el.parse_leaf("Handle")?,
                    label: el.leaf("Label")?.to_string(),
                    direction: el.parse_leaf("Direction")?,
                })
            })
            .collect::<Result<_>>()
            .map(Message::ChkDefs),
        "Param_defs" => body
            .children_named("Param")
            .map(read_param_def)
            .collect::<Result<_>>()
            .map(Message::ParamDefs),
        "Supp_cmds" => body
            .children_named("Command")
            .map(|el| {
                Ok(CommandDef {
                    id: el.parse_leaf("Cmd_id")?,
                    params: el
                        .children_named("Param")
                        .map(read_param_def)
                        .collect::<Result<_>>()?,
                })
            })
            .collect::<Result<_>>()
            .map(Message::SupportedCommands),
        "App_status" => Ok(Message::Status(StatusMsg {
            seq_num: body.parse_leaf("Seq_num")?,
            params: read_updates(body)?,
            commands: read_invocations(body)?,
        })),
        "Steer_control" => Ok(Message::Control(ControlMsg {
            params: read_updates(body)?,
            commands: read_invocations(body)?,
        })),
        "Steer_log" => {
            let entries = body
                .children_named("Log_entry")
                .map(read_log_record)
                .collect::<Result<_>>()?;
            let histories = body
                .children_named("Param_history")
                .map(|el| {
                    Ok(ParamHistory {
                        handle: el.parse_leaf("Handle")?,
                        values: el
                            .children_named("Value")
                            .map(|v| v.text().map(str::to_string))
                            .collect::<Result<_>>()?,
                    })
                })
                .collect::<Result<_>>()?;
            Ok(Message::Log(LogMsg { entries, histories }))
        }
        "IO_data" => {
            let data = body.child("Data")?;
            let ParamValue::Bin(bytes) = ParamValue::parse(ParamType::Bin, data.text()?)
                .map_err(|_| ProtoError::malformed(data.line, "<Data> is not hex"))?
            else {
                return Err(ProtoError::malformed(data.line, "<Data> is not hex"));
            };
            Ok(Message::IoData(IoDataMsg {
                handle: body.parse_leaf("Handle")?,
                seq_num: body.parse_leaf("Seq_num")?,
                data: bytes,
            }))
        }
        "Error_msg" => Ok(Message::Error(body.text()?.to_string())),
        other => Err(ProtoError::UnexpectedKind(other.to_string())),
    }
}

/// Identify the kind of an encoded message without building it.
pub fn peek_kind(text: &str) -> Result<MessageKind> {
    let root = parse_tree(text)?;
    let Some(body) = root.children.first() else {
        return Ok(MessageKind::NotSet);
    };
    [
        MessageKind::IoDefs,
        MessageKind::ChkDefs,
        MessageKind::ParamDefs,
        MessageKind::SupportedCommands,
        MessageKind::Status,
        MessageKind::Control,
        MessageKind::Log,
        MessageKind::IoData,
        MessageKind::Error,
    ]
    .into_iter()
    .find(|kind| body_tag(*kind) == Some(body.name.as_str()))
    .ok_or_else(|| ProtoError::UnexpectedKind(body.name.clone()))
}

fn write_param_def(w: &mut TagWriter, def: &ParamDef) {
    w.open("Param");
    w.leaf("Handle", &def.handle.to_string());
    w.leaf("Label", &def.label);
    w.leaf("Steerable", flag(def.steerable));
    w.leaf("Type", def.kind.as_str());
    w.leaf("Value", &def.value);
    w.leaf("Internal", flag(def.internal));
    if let Some(min) = &def.min {
        w.leaf("Min_value", min);
    }
    if let Some(max) = &def.max {
        w.leaf("Max_value", max);
    }
    w.close("Param");
}

fn read_param_def(el: &Element) -> Result<ParamDef> {
    Ok(ParamDef {
        handle: el.parse_leaf("Handle")?,
        label: el.leaf("Label")?.to_string(),
        steerable: el.flag("Steerable")?,
        kind: el.parse_leaf("Type")?,
        value: el.leaf("Value")?.to_string(),
        internal: el.flag("Internal")?,
        min: el.opt_leaf("Min_value")?.map(str::to_string),
        max: el.opt_leaf("Max_value")?.map(str::to_string),
    })
}

fn write_updates(w: &mut TagWriter, updates: &[ParamUpdate]) {
    for update in updates {
        w.open("Param");
        w.leaf("Handle", &update.handle.to_string());
        w.leaf("Value", &update.value);
        w.close("Param");
    }
}

fn read_updates(el: &Element) -> Result<Vec<ParamUpdate>> {
    el.children_named("Param")
        .map(|p| {
            Ok(ParamUpdate {
                handle: p.parse_leaf("Handle")?,
                value: p.leaf("Value")?.to_string(),
            })
        })
        .collect()
}

fn write_invocations(w: &mut TagWriter, commands: &[CommandInvocation]) {
    for command in commands {
        w.open("Command");
        w.leaf("Cmd_id", &command.id.to_string());
        for arg in &command.args {
            w.open("Cmd_param");
            w.leaf("Label", &arg.label);
            w.leaf("Value", &arg.value);
            w.close("Cmd_param");
        }
        w.close("Command");
    }
}

fn read_invocations(el: &Element) -> Result<Vec<CommandInvocation>> {
    el.children_named("Command")
        .map(|c| {
            Ok(CommandInvocation {
                id: c.parse_leaf("Cmd_id")?,
                args: c
                    .children_named("Cmd_param")
                    .map(|a| {
                        Ok(CommandArg {
                            label: a.leaf("Label")?.to_string(),
                            value: a.leaf("Value")?.to_string(),
                        })
                    })
                    .collect::<Result<_>>()?,
            })
        })
        .collect()
}

fn read_log_record(el: &Element) -> Result<LogRecord> {
    let kind = match el.leaf("Kind")? {
        "checkpoint" => LogKind::Checkpoint {
            chk_handle: el.parse_leaf::<Handle>("Chk_handle")?,
            tag: el.leaf("Chk_tag")?.to_string(),
        },
        "params" => LogKind::ParamSnapshot {
            seq_num: el.parse_leaf("Seq_num")?,
        },
        other => {
            return Err(ProtoError::malformed(
                el.line,
                format!("unknown log entry kind '{other}'"),
            ))
        }
    };
    Ok(LogRecord {
        key: el.parse_leaf("Key")?,
        kind,
        params: read_updates(el)?,
    })
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

#[derive(Default)]
struct TagWriter {
    out: String,
}

impl TagWriter {
    fn open(&mut self, name: &str) {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push_str(">\n");
    }

    fn close(&mut self, name: &str) {
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push_str(">\n");
    }

    fn leaf(&mut self, name: &str, text: &str) {
        self.out.push('<');
        self.out.push_str(name);
        self.out.push('>');
        escape_into(text, &mut self.out);
        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push_str(">\n");
    }

    fn finish(mut self) -> String {
        if self.out.ends_with('\n') {
            self.out.pop();
        }
        self.out
    }
}

fn escape_into(text: &str, out: &mut String) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\n' => out.push_str("&#10;"),
            '\r' => out.push_str("&#13;"),
            other => out.push(other),
        }
    }
}

fn unescape(text: &str, line: usize) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let semi = after
            .find(';')
            .ok_or_else(|| ProtoError::malformed(line, "unterminated character reference"))?;
        let decoded = match &after[..=semi] {
            "&amp;" => '&',
            "&lt;" => '<',
            "&gt;" => '>',
            "&#10;" => '\n',
            "&#13;" => '\r',
            other => {
                return Err(ProtoError::malformed(
                    line,
                    format!("unknown character reference '{other}'"),
                ))
            }
        };
        out.push(decoded);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Debug)]
struct Element {
    name: String,
    line: usize,
    text: Option<String>,
    children: Vec<Element>,
}

impl Element {
    fn new(name: &str, line: usize, text: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            line,
            text,
            children: Vec::new(),
        }
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn opt_child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn child(&self, name: &str) -> Result<&Element> {
        self.opt_child(name).ok_or_else(|| {
            ProtoError::malformed(self.line, format!("<{}> is missing <{name}>", self.name))
        })
    }

    fn text(&self) -> Result<&str> {
        if !self.children.is_empty() {
            return Err(ProtoError::malformed(
                self.line,
                format!("<{}> should hold text, not elements", self.name),
            ));
        }
        Ok(self.text.as_deref().unwrap_or(""))
    }

    fn leaf(&self, name: &str) -> Result<&str> {
        self.child(name)?.text()
    }

    fn opt_leaf(&self, name: &str) -> Result<Option<&str>> {
        self.opt_child(name).map(Element::text).transpose()
    }

    fn parse_leaf<T: FromStr>(&self, name: &str) -> Result<T> {
        let child = self.child(name)?;
        let text = child.text()?;
        text.trim().parse().map_err(|_| {
            ProtoError::malformed(child.line, format!("cannot parse <{name}> value '{text}'"))
        })
    }

    fn flag(&self, name: &str) -> Result<bool> {
        let child = self.child(name)?;
        match child.text()?.trim() {
            "1" | "true" => Ok(true),
            "0" | "false" => Ok(false),
            other => Err(ProtoError::malformed(
                child.line,
                format!("<{name}> should be 0 or 1, found '{other}'"),
            )),
        }
    }
}

enum Line<'a> {
    Open(&'a str),
    Close(&'a str),
    Leaf(&'a str, &'a str),
    Empty(&'a str),
}

fn valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn classify(line: &str, no: usize) -> Result<Line<'_>> {
    let bad = |reason: &str| ProtoError::malformed(no, reason.to_string());
    let rest = line.strip_prefix('<').ok_or_else(|| bad("expected a tag"))?;

    if let Some(close) = rest.strip_prefix('/') {
        let name = close.strip_suffix('>').ok_or_else(|| bad("unterminated close tag"))?;
        return if valid_name(name) {
            Ok(Line::Close(name))
        } else {
            Err(bad("invalid tag name"))
        };
    }
    if let Some(name) = rest.strip_suffix("/>") {
        if valid_name(name) {
            return Ok(Line::Empty(name));
        }
    }

    let gt = rest.find('>').ok_or_else(|| bad("unterminated tag"))?;
    let name = &rest[..gt];
    if !valid_name(name) {
        return Err(bad("invalid tag name"));
    }
    let after = &rest[gt + 1..];
    if after.is_empty() {
        return Ok(Line::Open(name));
    }
    let text = after
        .strip_suffix('>')
        .and_then(|t| t.strip_suffix(name))
        .and_then(|t| t.strip_suffix("</"))
        .ok_or_else(|| ProtoError::malformed(no, format!("<{name}> is not closed on its line")))?;
    if text.contains(['<', '>']) {
        return Err(bad("unescaped markup in text"));
    }
    Ok(Line::Leaf(name, text))
}

fn parse_tree(text: &str) -> Result<Element> {
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;
    let mut last_line = 0;

    for (idx, raw) in text.split('\n').enumerate() {
        let no = idx + 1;
        let line = raw.strip_suffix('\r').unwrap_or(raw).trim_start();
        if line.trim_end().is_empty() {
            continue;
        }
        last_line = no;
        if root.is_some() {
            return Err(ProtoError::malformed(no, "content after end of message"));
        }

        let finished = match classify(line, no)? {
            Line::Open(name) => {
                stack.push(Element::new(name, no, None));
                None
            }
            Line::Close(name) => {
                let open = stack
                    .pop()
                    .ok_or_else(|| ProtoError::malformed(no, format!("unmatched </{name}>")))?;
                if open.name != name {
                    return Err(ProtoError::malformed(
                        no,
                        format!("</{name}> closes <{}>", open.name),
                    ));
                }
                Some(open)
            }
            Line::Leaf(name, text) => Some(Element::new(name, no, Some(unescape(text, no)?))),
            Line::Empty(name) => Some(Element::new(name, no, Some(String::new()))),
        };

        if let Some(element) = finished {
            match stack.last_mut() {
                Some(parent) => parent.children.push(element),
                None => root = Some(element),
            }
        }
    }

    if let Some(open) = stack.last() {
        return Err(ProtoError::malformed(
            last_line,
            format!("<{}> is never closed", open.name),
        ));
    }
    root.ok_or_else(|| ProtoError::malformed(0, "empty message"))
}
