use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_serde::formats::Bincode;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{Liveness, Request, Response};

type FrameType = Framed<TcpStream, LengthDelimitedCodec>;
type Codec<I, O> = Bincode<I, O>;

/// A stream recieving: I: incoming item, O: outgoing
pub type MsgStream<I, O> = tokio_serde::Framed<FrameType, I, O, Codec<I, O>>;

/// coordinator side of a request connection to a storage node
pub type ToNode = MsgStream<Response, Request>;
/// storage node side of a request connection
pub type FromCoordinator = MsgStream<Request, Response>;
/// storage node side of the heartbeat connection, nothing is ever
/// send back over it
pub type LivenessSink = MsgStream<(), Liveness>;
/// coordinator side of the heartbeat connection
pub type LivenessSource = MsgStream<Liveness, ()>;

/// I: incoming item, O: outgoing
pub fn wrap<I, O>(stream: TcpStream) -> MsgStream<I, O> {
    let length_delimited = Framed::new(stream, LengthDelimitedCodec::new());
    tokio_serde::Framed::new(length_delimited, Bincode::<I, O>::default())
}

/// Open a framed connection, requests are small and latency bound
/// so nagle is disabled.
pub async fn connect<I, O>(addr: SocketAddr) -> io::Result<MsgStream<I, O>> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(wrap(stream))
}
