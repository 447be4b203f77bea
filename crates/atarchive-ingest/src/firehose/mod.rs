//! Live repository event stream.
//!
//! - [`source`] - where frames come from (relay WebSocket, or a test script)
//! - [`consumer`] - sequence validation, day partitioning and checkpointing

pub mod consumer;
pub mod source;

pub use consumer::{ConsumerState, ConsumerStats, FirehoseConfig, FirehoseConsumer};
pub use source::{FrameSource, FrameStream, WebSocketSource};

#[cfg(test)]
pub(crate) mod test_frames {
    use atarchive_core::cbor::test_support::{map, text};
    use atarchive_core::frame::test_support::frame;
    use ciborium::value::Value;

    fn int(n: u64) -> Value {
        Value::Integer(n.into())
    }

    /// A `#commit` frame with one delete operation.
    pub fn commit_frame(seq: u64, time: &str) -> Vec<u8> {
        frame(
            "#commit",
            map(vec![
                ("seq", int(seq)),
                ("repo", text("did:plc:alice")),
                ("rev", text("3kabc")),
                ("time", text(time)),
                (
                    "ops",
                    Value::Array(vec![map(vec![
                        ("action", text("delete")),
                        ("path", text("app.bsky.feed.like/3klike")),
                        ("cid", Value::Null),
                    ])]),
                ),
            ]),
        )
    }

    /// A sequenced kind that is not archived.
    pub fn sync_frame(seq: u64) -> Vec<u8> {
        frame(
            "#sync",
            map(vec![("seq", int(seq)), ("did", text("did:plc:alice"))]),
        )
    }

    pub fn info_frame(name: &str) -> Vec<u8> {
        frame("#info", map(vec![("name", text(name))]))
    }

    pub fn garbage_frame() -> Vec<u8> {
        vec![0xff, 0x00, 0x13]
    }
}
