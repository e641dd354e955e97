// MIT License - Copyright (c) 2026 Peter Wright
// C-Gate line formats: command framing, key=value replies, events and status changes

use std::collections::HashMap;
use std::fmt;

use chrono::NaiveDateTime;

use crate::error::{GatewayError, Result};

/// Numeric id C-Gate uses to mean "no such object".
pub const NO_ENTITY_ID: u32 = 255;

/// Frame an outgoing command: `[<id>] <text>\r\n`.
pub fn format_command(id: u32, text: &str) -> String {
    format!("[{}] {}\r\n", id, text)
}

/// Split a tagged command-port line into its id and response text.
///
/// `"[12] 200 OK."` -> `Some((12, "200 OK."))`. Untagged lines return `None`.
pub fn split_tagged(line: &str) -> Option<(u32, &str)> {
    let rest = line.strip_prefix('[')?;
    let (id, text) = rest.split_once(']')?;
    let id = id.trim().parse().ok()?;
    Some((id, text.strip_prefix(' ').unwrap_or(text)))
}

/// A response line continues when the character after the status code is `-`.
pub fn is_continuation(text: &str) -> bool {
    text.as_bytes().get(3) == Some(&b'-')
}

/// Parse an entity id. Ids 0-254 are valid; 255 and anything unparsable mean "none".
pub fn parse_entity_id(raw: &str) -> Option<u8> {
    match raw.trim().parse::<u32>() {
        Ok(id) if id < NO_ENTITY_ID => u8::try_from(id).ok(),
        _ => None,
    }
}

/// How the body of a reply line is split into key/value pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStyle {
    /// Space-separated `key=value` tokens
    Tokens,
    /// The whole body is one `key=value` pair; the value may contain spaces
    Database,
}

fn normalize_value(value: &str) -> String {
    if value == "null" {
        String::new()
    } else {
        value.to_string()
    }
}

/// Parse the body of a reply line (after the 4-character status header).
pub fn response_to_map(line: &str, style: MapStyle) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(body) = line.get(4..) else {
        return map;
    };

    match style {
        MapStyle::Tokens => {
            for token in body.split_whitespace() {
                if let Some((key, value)) = token.split_once('=') {
                    map.insert(key.to_string(), normalize_value(value));
                }
            }
        }
        MapStyle::Database => {
            if let Some((key, value)) = body.trim().split_once('=') {
                map.insert(key.to_string(), normalize_value(value));
            }
        }
    }
    map
}

/// A parsed object address such as `//HOME/254/56/1` or `//HOME/254/p/12`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPath {
    Project { project: String },
    Network { project: String, network: u8 },
    Application { project: String, network: u8, application: u8 },
    Group { project: String, network: u8, application: u8, group: u8 },
    Unit { project: String, network: u8, unit: u8 },
}

impl ObjectPath {
    pub fn parse(address: &str) -> Result<Self> {
        let invalid = || GatewayError::InvalidAddress {
            address: address.to_string(),
        };
        let body = address.strip_prefix("//").ok_or_else(invalid)?;
        let parts: Vec<&str> = body.split('/').collect();
        let project = parts
            .first()
            .filter(|p| !p.is_empty())
            .ok_or_else(invalid)?
            .to_string();
        let id = |raw: &str| parse_entity_id(raw).ok_or_else(invalid);

        match parts[..] {
            [_] => Ok(ObjectPath::Project { project }),
            [_, n] => Ok(ObjectPath::Network {
                project,
                network: id(n)?,
            }),
            [_, n, a] => Ok(ObjectPath::Application {
                project,
                network: id(n)?,
                application: id(a)?,
            }),
            [_, n, p, u] if p.eq_ignore_ascii_case("p") => Ok(ObjectPath::Unit {
                project,
                network: id(n)?,
                unit: id(u)?,
            }),
            [_, n, a, g] => Ok(ObjectPath::Group {
                project,
                network: id(n)?,
                application: id(a)?,
                group: id(g)?,
            }),
            _ => Err(invalid()),
        }
    }

    pub fn project(&self) -> &str {
        match self {
            ObjectPath::Project { project }
            | ObjectPath::Network { project, .. }
            | ObjectPath::Application { project, .. }
            | ObjectPath::Group { project, .. }
            | ObjectPath::Unit { project, .. } => project,
        }
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectPath::Project { project } => write!(f, "//{project}"),
            ObjectPath::Network { project, network } => write!(f, "//{project}/{network}"),
            ObjectPath::Application {
                project,
                network,
                application,
            } => write!(f, "//{project}/{network}/{application}"),
            ObjectPath::Group {
                project,
                network,
                application,
                group,
            } => write!(f, "//{project}/{network}/{application}/{group}"),
            ObjectPath::Unit {
                project,
                network,
                unit,
            } => write!(f, "//{project}/{network}/p/{unit}"),
        }
    }
}

/// One object reported by `tree //P/N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEntry {
    Group {
        application: u8,
        group: u8,
        level: Option<u8>,
    },
    Unit {
        unit: u8,
        unit_type: String,
    },
}

/// Parse one `tree` reply line belonging to `network` of `project`.
///
/// Lines describing other networks, bare applications or anything else are skipped.
pub fn parse_tree_line(line: &str, project: &str, network: u8) -> Option<TreeEntry> {
    let body = line.get(4..)?;
    let mut tokens = body.split_whitespace();
    let path = ObjectPath::parse(tokens.next()?).ok()?;
    let attrs: HashMap<&str, &str> = tokens.filter_map(|t| t.split_once('=')).collect();

    match path {
        ObjectPath::Group {
            project: p,
            network: n,
            application,
            group,
        } if p == project && n == network => Some(TreeEntry::Group {
            application,
            group,
            level: attrs.get("level").and_then(|l| l.parse().ok()),
        }),
        ObjectPath::Unit {
            project: p,
            network: n,
            unit,
        } if p == project && n == network => Some(TreeEntry::Unit {
            unit,
            unit_type: attrs.get("type").map(|t| t.to_string()).unwrap_or_default(),
        }),
        _ => None,
    }
}

/// An unsolicited line from the event port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CGateEvent {
    pub timestamp: Option<NaiveDateTime>,
    pub code: u16,
    pub payload: String,
    pub raw: String,
}

impl CGateEvent {
    /// Parse `YYYYMMDD-HHMMSS <code> <payload>`. Returns `None` for lines too
    /// short to carry a code.
    pub fn parse(line: &str) -> Option<Self> {
        let code: u16 = line.get(16..19)?.parse().ok()?;
        let timestamp = line
            .get(..15)
            .and_then(|ts| NaiveDateTime::parse_from_str(ts, "%Y%m%d-%H%M%S").ok());
        let payload = line.get(19..).unwrap_or("").trim().to_string();
        Some(Self {
            timestamp,
            code,
            payload,
            raw: line.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusAction {
    On,
    Off,
    Ramp,
    TerminateRamp,
    Other(String),
}

impl StatusAction {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "on" => StatusAction::On,
            "off" => StatusAction::Off,
            "ramp" => StatusAction::Ramp,
            "terminateramp" => StatusAction::TerminateRamp,
            other => StatusAction::Other(other.to_string()),
        }
    }
}

/// A line from the status change port, e.g.
/// `lighting ramp //HOME/254/56/1 128 4 #sourceunit=8 OID=...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub application: String,
    pub action: StatusAction,
    pub address: String,
    pub level: Option<u8>,
    pub ramp_secs: Option<u32>,
    pub attributes: HashMap<String, String>,
    pub raw: String,
}

impl StatusChange {
    pub fn parse(line: &str) -> Option<Self> {
        let (head, tail) = match line.split_once('#') {
            Some((head, tail)) => (head, tail),
            None => (line, ""),
        };
        let mut tokens = head.split_whitespace();
        let application = tokens.next()?.to_string();
        let action = StatusAction::parse(tokens.next()?);
        let address = tokens.next()?.to_string();
        let level = tokens.next().and_then(|t| t.parse().ok());
        let ramp_secs = tokens.next().and_then(|t| t.trim_end_matches('s').parse().ok());
        let attributes = tail
            .split_whitespace()
            .filter_map(|t| t.split_once('='))
            .map(|(k, v)| (k.to_string(), normalize_value(v)))
            .collect();

        Some(Self {
            application,
            action,
            address,
            level,
            ramp_secs,
            attributes,
            raw: line.to_string(),
        })
    }

    /// The group level this change leaves behind, when it determines one.
    pub fn resulting_level(&self) -> Option<u8> {
        match self.action {
            StatusAction::On => Some(255),
            StatusAction::Off => Some(0),
            StatusAction::Ramp => self.level,
            StatusAction::TerminateRamp | StatusAction::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_format_and_split() {
        assert_eq!(format_command(7, "noop"), "[7] noop\r\n");
        assert_eq!(split_tagged("[7] 200 OK."), Some((7, "200 OK.")));
        assert_eq!(split_tagged("201 Service ready"), None);
        assert_eq!(split_tagged("[x] 200 OK."), None);
    }

    #[test]
    fn test_continuation_marker() {
        assert!(is_continuation("200-partial"));
        assert!(!is_continuation("200 rest"));
        assert!(!is_continuation("200"));
    }

    #[test]
    fn test_entity_id_sentinel() {
        assert_eq!(parse_entity_id("0"), Some(0));
        assert_eq!(parse_entity_id("254"), Some(254));
        assert_eq!(parse_entity_id("255"), None);
        assert_eq!(parse_entity_id("1000"), None);
        assert_eq!(parse_entity_id("abc"), None);
    }

    #[test]
    fn test_token_map_with_null() {
        let map = response_to_map("131 network=254 project=HOME state=null", MapStyle::Tokens);
        assert_eq!(map["network"], "254");
        assert_eq!(map["project"], "HOME");
        assert_eq!(map["state"], "");
    }

    #[test]
    fn test_database_map_keeps_spaces() {
        let map = response_to_map("300 TagName=Kitchen Lights", MapStyle::Database);
        assert_eq!(map["TagName"], "Kitchen Lights");
        let map = response_to_map("300 TagName=null", MapStyle::Database);
        assert_eq!(map["TagName"], "");
    }

    #[test]
    fn test_short_line_gives_empty_map() {
        assert!(response_to_map("200", MapStyle::Tokens).is_empty());
    }

    #[test]
    fn test_object_path_round_trip() {
        for addr in ["//HOME", "//HOME/254", "//HOME/254/56", "//HOME/254/56/1", "//HOME/254/p/12"] {
            assert_eq!(ObjectPath::parse(addr).unwrap().to_string(), addr);
        }
        assert!(ObjectPath::parse("HOME/254").is_err());
        assert!(ObjectPath::parse("//HOME/255").is_err());
        assert!(ObjectPath::parse("//HOME/254/56/1/2").is_err());
    }

    #[test]
    fn test_tree_lines() {
        assert_eq!(
            parse_tree_line("343-//HOME/254/56/1 level=128", "HOME", 254),
            Some(TreeEntry::Group {
                application: 56,
                group: 1,
                level: Some(128)
            })
        );
        assert_eq!(
            parse_tree_line("343-//HOME/254/p/12 type=KEYBL4 app=56", "HOME", 254),
            Some(TreeEntry::Unit {
                unit: 12,
                unit_type: "KEYBL4".to_string()
            })
        );
        assert_eq!(parse_tree_line("343-//HOME/253/56/1", "HOME", 254), None);
        assert_eq!(parse_tree_line("320 Tree end", "HOME", 254), None);
    }

    #[test]
    fn test_event_line() {
        let ev = CGateEvent::parse("20260118-134501 702 Lighting group 56/1 on").unwrap();
        let ts = ev.timestamp.unwrap();
        assert_eq!((ts.year(), ts.month(), ts.day()), (2026, 1, 18));
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (13, 45, 1));
        assert_eq!(ev.code, 702);
        assert_eq!(ev.payload, "Lighting group 56/1 on");

        let bare = CGateEvent::parse("20260118-134501 701").unwrap();
        assert_eq!(bare.payload, "");
        assert!(CGateEvent::parse("short").is_none());
    }

    #[test]
    fn test_status_change_line() {
        let sc = StatusChange::parse("lighting ramp //HOME/254/56/1 128 4 #sourceunit=8 OID=null").unwrap();
        assert_eq!(sc.application, "lighting");
        assert_eq!(sc.action, StatusAction::Ramp);
        assert_eq!(sc.address, "//HOME/254/56/1");
        assert_eq!(sc.level, Some(128));
        assert_eq!(sc.ramp_secs, Some(4));
        assert_eq!(sc.attributes["sourceunit"], "8");
        assert_eq!(sc.attributes["OID"], "");
        assert_eq!(sc.resulting_level(), Some(128));

        let on = StatusChange::parse("lighting on //HOME/254/56/2  #sourceunit=8").unwrap();
        assert_eq!(on.resulting_level(), Some(255));
        let stop = StatusChange::parse("lighting terminateramp //HOME/254/56/2").unwrap();
        assert_eq!(stop.resulting_level(), None);
        assert!(StatusChange::parse("lighting on").is_none());
    }
}
