//! Server-notice text recognizer.
//!
//! Turns the free-text `*** Notice -- ...` lines a server sends to opers
//! into a closed set of structured events. Anything else is not ours to
//! interpret; `recognize` returns `None` and the dispatcher drops the line.

/// A recognized server notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A client connected locally to the sending server.
    ClientConnect { nick: String },
    /// A client disconnected from the sending server.
    ClientExit { nick: String },
    /// `far` (and its subtree) split away from `near`.
    Split { near: String, far: String },
    /// `far` (and a possibly large, unseen subtree) linked back to `near`.
    Join { near: String, far: String },
}

const NOTICE_PREFIX: &str = "*** Notice -- ";

/// Match one notice body against the recognized patterns.
pub fn recognize(text: &str) -> Option<Notice> {
    let body = text.strip_prefix(NOTICE_PREFIX)?;

    if let Some(tail) = body.strip_prefix("Client connecting: ") {
        return first_word(tail).map(|nick| Notice::ClientConnect { nick });
    }
    if let Some(tail) = body.strip_prefix("Client exiting: ") {
        return first_word(tail).map(|nick| Notice::ClientExit { nick });
    }
    if let Some(tail) = body.strip_prefix("Netsplit ") {
        return linked_pair(tail).map(|(near, far)| Notice::Split { near, far });
    }
    if let Some(tail) = body.strip_prefix("Netjoin ") {
        return linked_pair(tail).map(|(near, far)| Notice::Join { near, far });
    }
    None
}

fn first_word(tail: &str) -> Option<String> {
    tail.split_whitespace().next().map(str::to_owned)
}

/// Parse `<near> <-> <far> ...` as used by netsplit/netjoin notices.
fn linked_pair(tail: &str) -> Option<(String, String)> {
    let mut words = tail.split_whitespace();
    let near = words.next()?;
    if words.next()? != "<->" {
        return None;
    }
    let far = words.next()?;
    Some((near.to_owned(), far.to_owned()))
}
