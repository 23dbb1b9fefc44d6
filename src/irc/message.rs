//! IRC message parsing and serialization (RFC 2812).
//!
//! A message is `[:source SPACE] command [SPACE params] [SPACE :trailing]`,
//! CR-LF terminated on the wire. Parsing operates on the line without the
//! terminator. The numerics this bot consumes are named below so call sites
//! never match on bare digit strings.

use std::fmt;

/// Start of the registered session; the source is our uplink server.
pub const RPL_WELCOME: &str = "001";
/// Local user count for a queried server (`LUSERS * <server>`).
pub const RPL_LOCALUSERS: &str = "265";
/// One server link: `364 <me> <server> <uplink> :<hops> <info>`.
pub const RPL_LINKS: &str = "364";
/// Terminator for a LINKS listing.
pub const RPL_ENDOFLINKS: &str = "365";
/// Oper privileges granted.
pub const RPL_YOUREOPER: &str = "381";
/// Reply to a remote `TIME <server>` probe.
pub const RPL_TIME: &str = "391";
/// One fragment of an oper challenge blob.
pub const RPL_RSACHALLENGE2: &str = "740";
/// Terminator for a challenge blob.
pub const RPL_ENDOFRSACHALLENGE2: &str = "741";
/// SASL authentication succeeded.
pub const RPL_SASLSUCCESS: &str = "903";
/// SASL authentication failed.
pub const ERR_SASLFAIL: &str = "904";

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Originating server or `nick!user@host`, when present.
    pub source: Option<String>,
    /// Command word or three-digit numeric.
    pub command: String,
    /// Parameters; a trailing parameter may contain spaces.
    pub params: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty line")]
    Empty,
    #[error("source without a command")]
    MissingCommand,
}

impl Message {
    /// Build an outbound message with no source.
    pub fn cmd<S, I, P>(command: S, params: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        Message {
            source: None,
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Build an outbound message with no parameters.
    pub fn bare<S: Into<String>>(command: S) -> Self {
        Message::cmd(command, [] as [&str; 0])
    }

    /// The nick portion of the source (`nick!user@host` → `nick`), or the
    /// whole source when it names a server.
    pub fn source_name(&self) -> Option<&str> {
        self.source
            .as_deref()
            .map(|s| s.split('!').next().unwrap_or(s))
    }

    /// True when the source names a server rather than a client.
    pub fn from_server(&self) -> bool {
        self.source.as_deref().is_some_and(|s| !s.contains('!'))
    }

    /// Parse one line, without its `\r\n` terminator.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut rest = line;
        let source = if let Some(tail) = rest.strip_prefix(':') {
            let Some((src, after)) = tail.split_once(' ') else {
                return Err(ParseError::MissingCommand);
            };
            rest = after.trim_start_matches(' ');
            Some(src.to_owned())
        } else {
            None
        };

        let (command, mut rest) = match rest.split_once(' ') {
            Some((cmd, tail)) => (cmd, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            match rest.split_once(' ') {
                Some((word, tail)) => {
                    params.push(word.to_owned());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            source,
            command: command.to_owned(),
            params,
        })
    }

    /// Serialize to wire form, without the `\r\n` terminator.
    ///
    /// The last parameter gets a `:` sigil only when it needs one (empty,
    /// contains a space, or starts with `:`), so probe commands stay in the
    /// compact form most daemons log.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if let Some(src) = &self.source {
            out.push(':');
            out.push_str(src);
            out.push(' ');
        }
        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push(' ');
            if last.is_empty() || last.starts_with(':') || last.contains(' ') {
                out.push(':');
            }
            out.push_str(last);
        }
        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_bare_command() {
        let msg = Message::parse("LINKS").unwrap();
        assert_eq!(msg.source, None);
        assert_eq!(msg.command, "LINKS");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn parse_probe_command() {
        let msg = Message::parse("TIME hub.example.net").unwrap();
        assert_eq!(msg.command, "TIME");
        assert_eq!(msg.params, vec!["hub.example.net"]);
    }

    #[test]
    fn parse_links_reply() {
        let msg = Message::parse(
            ":hub.example.net 364 canopy leaf.example.net hub.example.net :1 leafy",
        )
        .unwrap();
        assert_eq!(msg.source.as_deref(), Some("hub.example.net"));
        assert_eq!(msg.command, RPL_LINKS);
        assert_eq!(
            msg.params,
            vec!["canopy", "leaf.example.net", "hub.example.net", "1 leafy"]
        );
    }

    #[test]
    fn parse_time_reply() {
        let msg = Message::parse(
            ":leaf.example.net 391 canopy leaf.example.net :Friday August 1 2025",
        )
        .unwrap();
        assert_eq!(msg.command, RPL_TIME);
        assert_eq!(msg.source_name(), Some("leaf.example.net"));
    }

    #[test]
    fn parse_server_notice() {
        let msg = Message::parse(
            ":hub.example.net NOTICE * :*** Notice -- Netsplit hub.example.net <-> leaf.example.net (reason)",
        )
        .unwrap();
        assert_eq!(msg.command, "NOTICE");
        assert!(msg.from_server());
        assert!(msg.params[1].starts_with("*** Notice -- Netsplit"));
    }

    #[test]
    fn parse_client_source_is_not_server() {
        let msg = Message::parse(":nick!user@host PRIVMSG #ops :hi").unwrap();
        assert!(!msg.from_server());
        assert_eq!(msg.source_name(), Some("nick"));
    }

    #[test]
    fn parse_trailing_with_colon() {
        let msg = Message::parse("PRIVMSG #ops ::(").unwrap();
        assert_eq!(msg.params, vec!["#ops", ":("]);
    }

    #[test]
    fn parse_empty_trailing() {
        let msg = Message::parse("AUTHENTICATE :").unwrap();
        assert_eq!(msg.params, vec![""]);
    }

    #[test]
    fn parse_rejects_empty() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
        assert_eq!(Message::parse("\r\n"), Err(ParseError::Empty));
    }

    #[test]
    fn parse_rejects_source_only() {
        assert_eq!(Message::parse(":hub.example.net"), Err(ParseError::MissingCommand));
    }

    #[test]
    fn wire_compact_params_stay_bare() {
        let msg = Message::cmd("LUSERS", ["*", "leaf.example.net"]);
        assert_eq!(msg.to_wire(), "LUSERS * leaf.example.net");
    }

    #[test]
    fn wire_spaced_trailing_gets_sigil() {
        let msg = Message::cmd("PRIVMSG", ["#ops", "WARN: leaf split from hub"]);
        assert_eq!(msg.to_wire(), "PRIVMSG #ops :WARN: leaf split from hub");
    }

    #[test]
    fn wire_empty_trailing_gets_sigil() {
        let msg = Message::cmd("AUTHENTICATE", [""]);
        assert_eq!(msg.to_wire(), "AUTHENTICATE :");
    }

    #[test]
    fn wire_roundtrip() {
        for line in [
            "TIME hub.example.net",
            ":hub.example.net 365 canopy * :End of /LINKS list.",
            "PRIVMSG #ops :INFO: leaf.example.net caught up",
        ] {
            let msg = Message::parse(line).unwrap();
            assert_eq!(Message::parse(&msg.to_wire()).unwrap(), msg);
        }
    }
}
