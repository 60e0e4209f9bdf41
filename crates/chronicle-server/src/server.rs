//! Command dispatch over the multipart protocol.
//!
//! One state: awaiting a command. The first frame names the command, the
//! remaining frames carry its arguments. Malformed argument frames are
//! answered with `"Error: bad frame"` and unknown commands with
//! `"Error: unknown command"`; either way the connection keeps serving.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chronicle_engine::ActionHandler;
use chronicle_types::{Event, ExpectedVersion, Payload};

use crate::protocol::{recv_message, send_message, MultipartCodec, ProtocolError};

/// Byte width of an aggregate id frame.
const UUID_SIZE: usize = 16;

/// Byte width of the `AddEvent_v2` argument frame (uuid + version word).
const V2_ARGS_SIZE: usize = UUID_SIZE + 4;

type Connection = Framed<TcpStream, MultipartCodec>;

//─────────────────────────────
//  Server
//─────────────────────────────

/// Request/reply command server bound to a TCP listener.
pub struct CommandServer {
    handler: Arc<ActionHandler>,
    listener: TcpListener,
    shutdown_tx: watch::Sender<bool>,
}

impl CommandServer {
    /// Bind to `addr` and prepare to serve `handler`.
    pub async fn bind<A: ToSocketAddrs>(addr: A, handler: Arc<ActionHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            handler,
            listener,
            shutdown_tx,
        })
    }

    /// Address the server actually bound (useful with port 0).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Handle that stops the accept loop when signalled.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Accept and serve connections until a `Shutdown` command arrives.
    ///
    /// Connections are served concurrently; requests on one connection are
    /// processed serially. Write safety across connections comes from the
    /// engine's per-stream locks.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "client connected");
                    let handler = self.handler.clone();
                    let shutdown_tx = self.shutdown_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handler, shutdown_tx).await {
                            warn!(error = %e, "connection ended with error");
                        }
                    });
                }
                _ = shutdown_rx.changed() => {
                    info!("shutdown requested, stopping accept loop");
                    return Ok(());
                }
            }
        }
    }
}

//─────────────────────────────
//  Connection loop
//─────────────────────────────

enum Flow {
    Continue,
    Shutdown,
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<ActionHandler>,
    shutdown: watch::Sender<bool>,
) -> Result<(), ProtocolError> {
    let mut framed = Framed::new(stream, MultipartCodec);
    while let Some(frames) = recv_message(&mut framed).await? {
        match dispatch(&handler, &mut framed, &frames).await? {
            Flow::Continue => {}
            Flow::Shutdown => {
                let _ = shutdown.send(true);
                break;
            }
        }
    }
    Ok(())
}

async fn dispatch(
    handler: &ActionHandler,
    framed: &mut Connection,
    frames: &[Bytes],
) -> Result<Flow, ProtocolError> {
    let command = String::from_utf8_lossy(&frames[0]).into_owned();
    match command.as_str() {
        "AddEvent" => add_event_v1(handler, framed, frames).await?,
        "AddEvent_v2" => add_event_v2(handler, framed, frames).await?,
        "ReadStream" | "ReadStream_v2" => {
            read_stream(handler, framed, frames, command.ends_with("_v2")).await?
        }
        "ReadAll" | "ReadAll_v2" => {
            read_all(handler, framed, command.ends_with("_v2")).await?
        }
        "Shutdown" => {
            info!("-> Shutdown");
            return Ok(Flow::Shutdown);
        }
        other => {
            warn!(command = %other, "unknown command");
            reply_error(framed, "unknown command").await?;
        }
    }
    Ok(Flow::Continue)
}

//─────────────────────────────
//  Commands
//─────────────────────────────

async fn add_event_v1(
    handler: &ActionHandler,
    framed: &mut Connection,
    frames: &[Bytes],
) -> Result<(), ProtocolError> {
    let (aggregate_id, payload) = match (parse_uuid(frames, 1), frames.get(2)) {
        (Some(id), Some(payload)) => (id, payload),
        _ => return reply_error(framed, "bad frame").await,
    };
    info!(command = "AddEvent", aggregate = %aggregate_id);

    let event = Event::new(aggregate_id, Payload::Raw(payload.to_vec()));
    match handler.add_event(event, ExpectedVersion::Any).await {
        Ok(()) => reply_ok(framed).await,
        Err(e) => {
            error!(error = %e, "AddEvent failed");
            reply_error(framed, &e.to_string()).await
        }
    }
}

async fn add_event_v2(
    handler: &ActionHandler,
    framed: &mut Connection,
    frames: &[Bytes],
) -> Result<(), ProtocolError> {
    let args = frames.get(1).filter(|args| args.len() == V2_ARGS_SIZE);
    let (args, payload, metadata) = match (args, frames.get(2), frames.get(3)) {
        (Some(args), Some(payload), Some(metadata)) => (args, payload, metadata),
        _ => return reply_error(framed, "bad frame").await,
    };

    // 16 bytes of aggregate id, then the little-endian expected version.
    let aggregate_id = match Uuid::from_slice(&args[..UUID_SIZE]) {
        Ok(id) => id,
        Err(_) => return reply_error(framed, "bad frame").await,
    };
    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&args[UUID_SIZE..]);
    let expected = ExpectedVersion::from_wire(u32::from_le_bytes(version_bytes));
    info!(command = "AddEvent_v2", aggregate = %aggregate_id, version = expected.to_wire());

    let metadata = if metadata.is_empty() {
        Payload::Absent
    } else {
        Payload::Raw(metadata.to_vec())
    };
    let event = Event::new(aggregate_id, Payload::Raw(payload.to_vec())).with_metadata(metadata);
    match handler.add_event(event, expected).await {
        Ok(()) => reply_ok(framed).await,
        Err(e) => {
            error!(error = %e, "AddEvent_v2 failed");
            reply_error(framed, &e.to_string()).await
        }
    }
}

async fn read_stream(
    handler: &ActionHandler,
    framed: &mut Connection,
    frames: &[Bytes],
    v2: bool,
) -> Result<(), ProtocolError> {
    let aggregate_id = match parse_uuid(frames, 1) {
        Some(id) => id,
        None => return reply_error(framed, "bad frame").await,
    };
    info!(command = "ReadStream", aggregate = %aggregate_id, v2);

    match handler.retrieve_for(aggregate_id).await {
        Ok(events) => send_events(framed, &events, v2).await,
        Err(e) => {
            error!(error = %e, "ReadStream failed");
            reply_error(framed, &e.to_string()).await
        }
    }
}

async fn read_all(
    handler: &ActionHandler,
    framed: &mut Connection,
    v2: bool,
) -> Result<(), ProtocolError> {
    info!(command = "ReadAll", v2);
    match handler.retrieve_all().await {
        Ok(events) => send_events(framed, &events, v2).await,
        Err(e) => {
            error!(error = %e, "ReadAll failed");
            reply_error(framed, &e.to_string()).await
        }
    }
}

//─────────────────────────────
//  Replies
//─────────────────────────────

async fn reply_ok(framed: &mut Connection) -> Result<(), ProtocolError> {
    send_message(framed, vec![Bytes::from_static(b"Ok")]).await
}

async fn reply_error(framed: &mut Connection, text: &str) -> Result<(), ProtocolError> {
    send_message(framed, vec![Bytes::from(format!("Error: {text}"))]).await
}

async fn send_events(
    framed: &mut Connection,
    events: &[Event],
    v2: bool,
) -> Result<(), ProtocolError> {
    if events.is_empty() {
        return send_message(framed, vec![Bytes::from_static(b"0")]).await;
    }

    let mut frames = Vec::with_capacity(1 + events.len() * if v2 { 2 } else { 1 });
    frames.push(Bytes::from(events.len().to_string()));
    for event in events {
        frames.push(payload_frame(&event.payload));
        if v2 {
            frames.push(payload_frame(&event.metadata));
        }
    }
    info!(count = events.len(), "<- events");
    send_message(framed, frames).await
}

fn payload_frame(payload: &Payload) -> Bytes {
    match payload {
        Payload::Absent => Bytes::new(),
        Payload::Raw(bytes) => Bytes::from(bytes.clone()),
        Payload::Json { type_id, value } => Bytes::from(format!("{type_id} {value}")),
    }
}

fn parse_uuid(frames: &[Bytes], at: usize) -> Option<Uuid> {
    frames.get(at).and_then(|frame| Uuid::from_slice(frame).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_serial::PassthruSerializer;
    use chronicle_store_daily::DailyDiskStorage;
    use tokio::task::JoinHandle;

    async fn start_server(dir: &tempfile::TempDir) -> (std::net::SocketAddr, JoinHandle<Result<()>>) {
        let storage = Arc::new(DailyDiskStorage::open(dir.path()).await.unwrap());
        let serializer = Arc::new(PassthruSerializer::tunneling());
        let handler = Arc::new(ActionHandler::new(storage, serializer));

        let server = CommandServer::bind("127.0.0.1:0", handler).await.unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());
        (addr, task)
    }

    async fn connect(addr: std::net::SocketAddr) -> Connection {
        let stream = TcpStream::connect(addr).await.unwrap();
        Framed::new(stream, MultipartCodec)
    }

    async fn request(conn: &mut Connection, frames: Vec<Bytes>) -> Vec<Bytes> {
        send_message(conn, frames).await.unwrap();
        recv_message(conn).await.unwrap().unwrap()
    }

    fn v2_args(aggregate_id: Uuid, version: u32) -> Bytes {
        let mut args = Vec::with_capacity(V2_ARGS_SIZE);
        args.extend_from_slice(aggregate_id.as_bytes());
        args.extend_from_slice(&version.to_le_bytes());
        Bytes::from(args)
    }

    #[tokio::test]
    async fn test_add_event_v2_then_read_stream_v2() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        let aggregate_id = Uuid::new_v4();
        let reply = request(
            &mut conn,
            vec![
                Bytes::from_static(b"AddEvent_v2"),
                v2_args(aggregate_id, ExpectedVersion::ANY_WIRE),
                Bytes::from_static(b"myType {\"a\":1}"),
                Bytes::from_static(b"Metadata {\"user\":1}"),
            ],
        )
        .await;
        assert_eq!(reply, vec![Bytes::from_static(b"Ok")]);

        let reply = request(
            &mut conn,
            vec![
                Bytes::from_static(b"ReadStream_v2"),
                Bytes::copy_from_slice(aggregate_id.as_bytes()),
            ],
        )
        .await;
        assert_eq!(reply.len(), 3);
        assert_eq!(reply[0], Bytes::from_static(b"1"));
        assert_eq!(reply[1], Bytes::from_static(b"myType {\"a\":1}"));
        assert_eq!(reply[2], Bytes::from_static(b"Metadata {\"user\":1}"));
    }

    #[tokio::test]
    async fn test_add_event_v1_then_read_stream_v1() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        let aggregate_id = Uuid::new_v4();
        let reply = request(
            &mut conn,
            vec![
                Bytes::from_static(b"AddEvent"),
                Bytes::copy_from_slice(aggregate_id.as_bytes()),
                Bytes::from_static(b"myType {}"),
            ],
        )
        .await;
        assert_eq!(reply, vec![Bytes::from_static(b"Ok")]);

        let reply = request(
            &mut conn,
            vec![
                Bytes::from_static(b"ReadStream"),
                Bytes::copy_from_slice(aggregate_id.as_bytes()),
            ],
        )
        .await;
        assert_eq!(reply.len(), 2);
        assert_eq!(reply[0], Bytes::from_static(b"1"));
        assert_eq!(reply[1], Bytes::from_static(b"myType {}"));
    }

    #[tokio::test]
    async fn test_read_all_preserves_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        let stream1 = Uuid::new_v4();
        let stream2 = Uuid::new_v4();
        for (id, body) in [
            (stream1, &b"t 1st"[..]),
            (stream2, &b"t 2nd"[..]),
            (stream1, &b"t 3rd"[..]),
        ] {
            let reply = request(
                &mut conn,
                vec![
                    Bytes::from_static(b"AddEvent"),
                    Bytes::copy_from_slice(id.as_bytes()),
                    Bytes::copy_from_slice(body),
                ],
            )
            .await;
            assert_eq!(reply, vec![Bytes::from_static(b"Ok")]);
        }

        let reply = request(&mut conn, vec![Bytes::from_static(b"ReadAll")]).await;
        assert_eq!(reply.len(), 4);
        assert_eq!(reply[0], Bytes::from_static(b"3"));
        assert_eq!(reply[1], Bytes::from_static(b"t 1st"));
        assert_eq!(reply[2], Bytes::from_static(b"t 2nd"));
        assert_eq!(reply[3], Bytes::from_static(b"t 3rd"));
    }

    #[tokio::test]
    async fn test_empty_stream_replies_zero() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        let reply = request(
            &mut conn,
            vec![
                Bytes::from_static(b"ReadStream"),
                Bytes::copy_from_slice(Uuid::new_v4().as_bytes()),
            ],
        )
        .await;
        assert_eq!(reply, vec![Bytes::from_static(b"0")]);
    }

    #[tokio::test]
    async fn test_wrong_expected_version_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        let aggregate_id = Uuid::new_v4();
        let add = |version: u32| {
            vec![
                Bytes::from_static(b"AddEvent_v2"),
                v2_args(aggregate_id, version),
                Bytes::from_static(b"myType {}"),
                Bytes::new(),
            ]
        };

        let reply = request(&mut conn, add(0)).await;
        assert_eq!(reply, vec![Bytes::from_static(b"Ok")]);

        let reply = request(&mut conn, add(0)).await;
        assert_eq!(
            reply,
            vec![Bytes::from_static(
                b"Error: WrongExpectedVersion: expected 0 got 1"
            )]
        );

        let reply = request(&mut conn, add(1)).await;
        assert_eq!(reply, vec![Bytes::from_static(b"Ok")]);
    }

    #[tokio::test]
    async fn test_malformed_frames_get_explicit_error() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        // Aggregate id frame of the wrong width.
        let reply = request(
            &mut conn,
            vec![
                Bytes::from_static(b"AddEvent"),
                Bytes::from_static(b"not-a-uuid"),
                Bytes::from_static(b"t {}"),
            ],
        )
        .await;
        assert_eq!(reply, vec![Bytes::from_static(b"Error: bad frame")]);

        // Missing payload frame.
        let reply = request(
            &mut conn,
            vec![
                Bytes::from_static(b"ReadStream"),
                Bytes::from_static(b"short"),
            ],
        )
        .await;
        assert_eq!(reply, vec![Bytes::from_static(b"Error: bad frame")]);
    }

    #[tokio::test]
    async fn test_unknown_command_replies_error() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, _task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        let reply = request(&mut conn, vec![Bytes::from_static(b"Snapshot")]).await;
        assert_eq!(reply, vec![Bytes::from_static(b"Error: unknown command")]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_server() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, task) = start_server(&dir).await;
        let mut conn = connect(addr).await;

        send_message(&mut conn, vec![Bytes::from_static(b"Shutdown")])
            .await
            .unwrap();

        task.await.unwrap().unwrap();
    }
}
