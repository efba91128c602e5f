//! `ChangeFeedStream` - pull-based adapter from a byte stream to change records.
//!
//! The upstream body is only polled when no complete record is buffered, so a
//! slow consumer automatically stops reads from the connection; nothing is
//! dropped or reordered. Dropping the stream drops the body (closing the
//! connection) together with whatever partial record was buffered.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt, ready};

use super::transform::{ChangeFeedTransform, FeedFraming};
use crate::domain::{ChangeRecord, FeedError};
use crate::ports::ByteStream;

/// Turns one parsed JSON object into a change record. `Ok(None)` skips it
/// (design documents, heartbeats, ...).
pub type RecordDecoder =
    Box<dyn FnMut(serde_json::Value) -> Result<Option<ChangeRecord>, FeedError> + Send>;

pub struct ChangeFeedStream {
    body: Option<ByteStream>,
    transform: ChangeFeedTransform,
    decode: RecordDecoder,
    done: bool,
}

impl ChangeFeedStream {
    pub fn new(body: ByteStream, framing: FeedFraming, decode: RecordDecoder) -> Self {
        Self {
            body: Some(body),
            transform: ChangeFeedTransform::new(framing),
            decode,
            done: false,
        }
    }

    fn fail(&mut self, err: FeedError) -> Poll<Option<Result<ChangeRecord, FeedError>>> {
        tracing::debug!(error = %err, buffered = self.transform.buffered(), "change feed aborted");
        self.done = true;
        self.body = None;
        self.transform.reset();
        Poll::Ready(Some(Err(err)))
    }
}

impl Stream for ChangeFeedStream {
    type Item = Result<ChangeRecord, FeedError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }

            match this.transform.next_record() {
                Ok(Some(value)) => match (this.decode)(value) {
                    Ok(Some(record)) => return Poll::Ready(Some(Ok(record))),
                    Ok(None) => continue,
                    Err(e) => return this.fail(e),
                },
                Ok(None) => {}
                Err(e) => return this.fail(e),
            }

            let Some(body) = this.body.as_mut() else {
                this.done = true;
                return Poll::Ready(None);
            };
            match ready!(body.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => this.transform.push(&chunk),
                Some(Err(e)) => return this.fail(e),
                None => {
                    this.body = None;
                    if let Err(e) = this.transform.finish() {
                        return this.fail(e);
                    }
                    this.done = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}
