use std::io;

use serde::{Serialize, Serializer, ser::SerializeSeq};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Channel name reserved for the subscription declaration frame a client
/// sends right after connecting. Never valid as a user channel.
pub const SUBSCRIBE_CHANNEL: &str = "__subscribe__";

/// Upper bound on the JSON body of a single frame. A peer declaring a larger
/// frame is treated as malformed and disconnected.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The message could not be built or serialized on the sending side.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("channel name must not be empty")]
    EmptyChannel,
    #[error("channel name '{SUBSCRIBE_CHANNEL}' is reserved")]
    ReservedChannel,
    #[error("payload is not JSON-serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A frame on the wire could not be decoded.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte cap")]
    TooLarge { len: u32 },
    #[error("frame body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message array is empty")]
    Empty,
    #[error("first element of a message must be a non-empty string")]
    BadChannel,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One message on the bus: a target channel followed by arbitrary
/// JSON-serializable payload elements.
///
/// On the wire a message is the JSON array `[channel, ...payload]` inside a
/// length-prefixed frame; see [`read_message`] and [`write_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    channel: String,
    payload: Vec<Value>,
}

impl Message {
    /// Builds a message for a user channel. Rejects empty channel names and
    /// the reserved subscription sentinel.
    pub fn new(
        channel: impl Into<String>,
        payload: impl IntoIterator<Item = Value>,
    ) -> Result<Self, EncodeError> {
        let channel = channel.into();
        if channel.is_empty() {
            return Err(EncodeError::EmptyChannel);
        }
        if channel == SUBSCRIBE_CHANNEL {
            return Err(EncodeError::ReservedChannel);
        }
        Ok(Self {
            channel,
            payload: payload.into_iter().collect(),
        })
    }

    /// The declaration frame listing the channels a connection subscribes to.
    pub(crate) fn subscription(channels: &[String]) -> Self {
        Self {
            channel: SUBSCRIBE_CHANNEL.to_string(),
            payload: channels.iter().cloned().map(Value::String).collect(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn payload(&self) -> &[Value] {
        &self.payload
    }

    pub fn into_parts(self) -> (String, Vec<Value>) {
        (self.channel, self.payload)
    }

    pub(crate) fn is_subscription(&self) -> bool {
        self.channel == SUBSCRIBE_CHANNEL
    }

    /// Reads this message as a subscription declaration. Returns the declared
    /// channel names, or `None` if the message is not a declaration or any
    /// declared name is itself invalid.
    pub(crate) fn subscription_channels(&self) -> Option<Vec<String>> {
        if !self.is_subscription() {
            return None;
        }
        self.payload
            .iter()
            .map(|element| match element {
                Value::String(name) if !name.is_empty() && name != SUBSCRIBE_CHANNEL => {
                    Some(name.clone())
                }
                _ => None,
            })
            .collect()
    }
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(1 + self.payload.len()))?;
        seq.serialize_element(&self.channel)?;
        for element in &self.payload {
            seq.serialize_element(element)?;
        }
        seq.end()
    }
}

/// Encodes a message into its JSON body, without the length prefix.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decodes one frame body back into a message.
pub fn decode(body: &[u8]) -> Result<Message, FrameError> {
    let mut elements: Vec<Value> = serde_json::from_slice(body)?;
    if elements.is_empty() {
        return Err(FrameError::Empty);
    }
    let channel = match elements.remove(0) {
        Value::String(channel) if !channel.is_empty() => channel,
        _ => return Err(FrameError::BadChannel),
    };
    Ok(Message {
        channel,
        payload: elements,
    })
}

/// Reads one length-prefixed frame body. Returns `Ok(None)` once the peer
/// closes the stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge { len });
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Reads and decodes the next message from the stream.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(body) => Ok(Some(decode(&body)?)),
        None => Ok(None),
    }
}

/// Writes an already-encoded frame body behind its length prefix.
///
/// Prefix and body go out in a single `write_all` so writers that serialize
/// at a higher level never interleave partial frames on the wire.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame body too long"))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(body);
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Encodes and writes one message as a frame.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = encode(message).map_err(to_io_error)?;
    write_frame(writer, &body).await
}

fn to_io_error(err: EncodeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
