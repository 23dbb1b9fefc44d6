//! One-at-a-time multi-reply exchanges.
//!
//! Some queries (LINKS, the oper challenge) answer with an unknown number of
//! reply lines and a distinguished terminator, with nothing in the wire
//! format tying a reply to its request. Two such exchanges running at once
//! would interleave their reply streams, so every exchange runs under one
//! shared async mutex: send the request, accumulate data-shaped lines, stop
//! on the terminator. Unrelated lines that arrive mid-exchange are buffered
//! and handed back for dispatch after the exchange, preserving arrival
//! order for everything the exchange did not consume.

use futures::{Sink, SinkExt, Stream};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use crate::irc::codec::CodecError;
use crate::irc::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The stream ended before the terminator arrived. A partial
    /// accumulation is not a result; callers retry on their next trigger.
    #[error("connection closed before the reply terminator")]
    Aborted,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Everything one exchange produced.
#[derive(Debug, Default)]
pub struct Collected {
    /// Data-shaped replies, in arrival order.
    pub replies: Vec<Message>,
    /// Unrelated lines seen mid-exchange, for re-dispatch afterwards.
    pub deferred: Vec<Message>,
}

/// The shared exclusion for reply-stream exchanges.
#[derive(Debug, Default)]
pub struct ReplyCollector {
    lock: Mutex<()>,
}

impl ReplyCollector {
    pub fn new() -> Self {
        ReplyCollector::default()
    }

    /// Send `request` and collect its replies.
    ///
    /// Holds the exchange lock for the whole round trip; the guard's scope
    /// guarantees release on success, codec error, and abort alike.
    pub async fn exchange<S>(
        &self,
        io: &mut S,
        request: Message,
        is_data: impl Fn(&Message) -> bool,
        is_done: impl Fn(&Message) -> bool,
    ) -> Result<Collected, ExchangeError>
    where
        S: Stream<Item = Result<Message, CodecError>>
            + Sink<Message, Error = CodecError>
            + Unpin,
    {
        let _guard = self.lock.lock().await;

        io.send(request).await?;

        let mut collected = Collected::default();
        loop {
            match io.next().await {
                Some(Ok(msg)) if is_done(&msg) => return Ok(collected),
                Some(Ok(msg)) if is_data(&msg) => collected.replies.push(msg),
                Some(Ok(msg)) => collected.deferred.push(msg),
                Some(Err(err)) => return Err(err.into()),
                None => return Err(ExchangeError::Aborted),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::codec::LineCodec;
    use crate::irc::message::{RPL_ENDOFLINKS, RPL_LINKS};
    use tokio_util::codec::Framed;

    fn is_links(msg: &Message) -> bool {
        msg.command == RPL_LINKS
    }

    fn is_end(msg: &Message) -> bool {
        msg.command == RPL_ENDOFLINKS
    }

    #[tokio::test]
    async fn exchange_accumulates_until_terminator() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = Framed::new(near, LineCodec);
        let mut server = Framed::new(far, LineCodec);

        let serve = async {
            // Wait for the request, then answer with two links and the end.
            let req = server.next().await.unwrap().unwrap();
            assert_eq!(req.command, "LINKS");
            for line in [
                ":hub0 364 canopy leaf1 hub0 :1 leaf",
                ":hub0 364 canopy hub1 hub0 :1 hub",
                ":hub0 365 canopy * :End of /LINKS list.",
            ] {
                server.send(Message::parse(line).unwrap()).await.unwrap();
            }
        };

        let collector = ReplyCollector::new();
        let run = collector.exchange(&mut client, Message::bare("LINKS"), is_links, is_end);
        let (collected, ()) = tokio::join!(run, serve);
        let collected = collected.unwrap();

        assert_eq!(collected.replies.len(), 2);
        assert_eq!(collected.replies[0].params[1], "leaf1");
        assert_eq!(collected.replies[1].params[1], "hub1");
        assert!(collected.deferred.is_empty());
    }

    #[tokio::test]
    async fn unrelated_lines_are_deferred_in_order() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = Framed::new(near, LineCodec);
        let mut server = Framed::new(far, LineCodec);

        let serve = async {
            server.next().await.unwrap().unwrap();
            for line in [
                ":hub0 364 canopy leaf1 hub0 :1 leaf",
                ":hub0 NOTICE * :*** Notice -- Client connecting: alice [u@h]",
                "PING :hub0",
                ":hub0 365 canopy * :End of /LINKS list.",
            ] {
                server.send(Message::parse(line).unwrap()).await.unwrap();
            }
        };

        let collector = ReplyCollector::new();
        let run = collector.exchange(&mut client, Message::bare("LINKS"), is_links, is_end);
        let (collected, ()) = tokio::join!(run, serve);
        let collected = collected.unwrap();

        assert_eq!(collected.replies.len(), 1);
        assert_eq!(collected.deferred.len(), 2);
        assert_eq!(collected.deferred[0].command, "NOTICE");
        assert_eq!(collected.deferred[1].command, "PING");
    }

    #[tokio::test]
    async fn closed_stream_aborts_and_releases_the_lock() {
        let (near, far) = tokio::io::duplex(4096);
        let mut client = Framed::new(near, LineCodec);
        let mut server = Framed::new(far, LineCodec);

        let serve = async {
            server.next().await.unwrap().unwrap();
            server
                .send(Message::parse(":hub0 364 canopy leaf1 hub0 :1 leaf").unwrap())
                .await
                .unwrap();
            drop(server); // hang up before the terminator
        };

        let collector = ReplyCollector::new();
        let run = collector.exchange(&mut client, Message::bare("LINKS"), is_links, is_end);
        let (result, ()) = tokio::join!(run, serve);
        assert!(matches!(result, Err(ExchangeError::Aborted)));

        // The lock must be free again even though the exchange failed.
        assert!(collector.lock.try_lock().is_ok());
    }
}
