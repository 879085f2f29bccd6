//! Length-prefixed MessagePack request/reply framing over TCP.
//!
//! Every service in this crate speaks the same wire shape: a big-endian
//! `u64` byte length followed by one rmp-serde encoded object. Callers open
//! one connection per peer conversation and treat any transport error or
//! timeout as "no reply"; retrying is the caller's responsibility.

use std::net::SocketAddr;

use bytes::BytesMut;

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::SynodError;

/// Binds a listening socket on `addr` with address reuse enabled, so that
/// a freshly restarted server can reclaim its endpoint immediately.
pub async fn tcp_bind(addr: SocketAddr) -> Result<TcpListener, SynodError> {
    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

/// Sends an object of type `T` to writable connection half `conn_write`,
/// prefixed by its encoded byte length.
pub async fn send_framed<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), SynodError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let obj_bytes = encode_to_vec(obj)?;
    conn_write.write_u64(obj_bytes.len() as u64).await?;
    conn_write.write_all(&obj_bytes[..]).await?;
    conn_write.flush().await?;
    Ok(())
}

/// Receives an object of type `T` from readable connection half `conn_read`,
/// using `read_buf` as storage for partial reads. A cleanly closed
/// connection surfaces as an error; callers drop the connection either way.
pub async fn recv_framed<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, SynodError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // read length of obj first
    while read_buf.len() < 8 {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(SynodError("connection closed".into()));
        }
    }
    let obj_len = u64::from_be_bytes(read_buf[..8].try_into().unwrap());

    // then read the obj itself
    let obj_end = 8 + obj_len as usize;
    if read_buf.capacity() < obj_end {
        read_buf.reserve(obj_end - read_buf.capacity());
    }
    while read_buf.len() < obj_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(SynodError("connection closed".into()));
        }
    }
    let obj = decode_from_slice(&read_buf[8..obj_end])?;

    // discard bytes used in this call
    let _ = read_buf.split_to(obj_end);
    Ok(obj)
}

/// Performs one request/reply exchange with the server at `addr`, bounded by
/// `timeout` end to end. Connect failures, decode failures, and timeouts all
/// come back as `Err`, which callers treat as a lost message.
pub async fn call<Req, Reply>(
    addr: SocketAddr,
    req: &Req,
    timeout: Duration,
) -> Result<Reply, SynodError>
where
    Req: Serialize,
    Reply: DeserializeOwned,
{
    time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        send_framed(&mut stream, req).await?;
        let mut read_buf = BytesMut::with_capacity(1024);
        recv_framed(&mut read_buf, &mut stream).await
    })
    .await?
}
