use std::io::{Read, Write};
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::query::VisitFilter;
use crate::TrackDb;

// --- OpCodes ---
pub const OP_POPULATE: u8       = 0x01;
pub const OP_LAST_KNOWN: u8     = 0x02;
pub const OP_VISITS: u8         = 0x03;
pub const OP_METADATA: u8       = 0x04;
pub const OP_COMPACT: u8        = 0x05;
pub const OP_PURGE_TESTING: u8  = 0x06;

pub const STATUS_ERR: u8 = 0;
pub const STATUS_OK: u8  = 1;

/// Largest accepted request body.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

pub struct TrackServer {
    db: Arc<TrackDb>,
}

impl TrackServer {
    pub fn new(db: Arc<TrackDb>) -> Self {
        Self { db }
    }

    pub async fn run(&self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "trackdb listening");
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer)) => {
                    let db = self.db.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(socket, db).await {
                            // Ignore expected disconnections to keep logs clean
                            if e.kind() != std::io::ErrorKind::UnexpectedEof {
                                warn!(%peer, error = %e, "client error");
                            }
                        }
                    });
                }
                Err(e) => error!(error = %e, "connection failed"),
            }
        }
    }
}

async fn handle_client(mut stream: TcpStream, db: Arc<TrackDb>) -> std::io::Result<()> {
    loop {
        // 1. Read OpCode
        let mut op_buf = [0u8; 1];
        if stream.read_exact(&mut op_buf).await.is_err() {
            return Ok(());
        }
        let op_code = op_buf[0];

        // 2. Read Length
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return Ok(());
        }
        let length = u32::from_le_bytes(len_buf) as usize;

        // 3. Read Body
        if length > MAX_PAYLOAD {
            warn!(length, max = MAX_PAYLOAD, "payload too large");
            return Ok(());
        }
        let mut payload = vec![0u8; length];
        stream.read_exact(&mut payload).await?;

        if !matches!(
            op_code,
            OP_POPULATE | OP_LAST_KNOWN | OP_VISITS | OP_METADATA | OP_COMPACT | OP_PURGE_TESTING
        ) {
            warn!("unknown opcode 0x{:02X}", op_code);
            return Ok(());
        }

        // 4. Process Command (store work is blocking I/O)
        let db = db.clone();
        let reply = tokio::task::spawn_blocking(move || dispatch(&db, op_code, &payload)).await;
        let (status, body) = match reply {
            Ok(Ok(body)) => (STATUS_OK, body),
            Ok(Err(msg)) => (STATUS_ERR, msg.into_bytes()),
            Err(e) => {
                error!(error = %e, "request task failed");
                (STATUS_ERR, b"internal error".to_vec())
            }
        };

        let mut writer = BufWriter::new(&mut stream);
        writer.write_all(&[status]).await?;
        writer.write_all(&(body.len() as u32).to_le_bytes()).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;
    }
}

fn dispatch(db: &TrackDb, op_code: u8, payload: &[u8]) -> Result<Vec<u8>, String> {
    let body = match op_code {
        OP_POPULATE => {
            let stored = db.populate_features(payload).map_err(|e| e.to_string())?;
            debug!(stored = stored.len(), "populate");
            json!({ "stored": stored.len() })
        }
        OP_LAST_KNOWN => json!(db.last_known().map_err(|e| e.to_string())?),
        OP_VISITS => {
            let filter: VisitFilter = if payload.is_empty() {
                VisitFilter::default()
            } else {
                serde_json::from_slice(payload).map_err(|e| format!("bad visit filter: {}", e))?
            };
            json!(db.query_visits(&filter).map_err(|e| e.to_string())?)
        }
        OP_METADATA => json!(db.metadata().map_err(|e| e.to_string())?),
        OP_COMPACT => {
            let stats = db.compact().map_err(|e| e.to_string())?;
            json!({
                "live_entries": stats.live_entries,
                "bytes_before": stats.bytes_before,
                "bytes_after": stats.bytes_after,
            })
        }
        OP_PURGE_TESTING => json!({ "deleted": db.delete_testing_data().map_err(|e| e.to_string())? }),
        other => return Err(format!("unknown opcode 0x{:02X}", other)),
    };
    serde_json::to_vec(&body).map_err(|e| e.to_string())
}

/// Blocking client side of the framing: sends one request, reads one reply.
pub fn call<S: Read + Write>(stream: &mut S, op_code: u8, payload: &[u8]) -> std::io::Result<(u8, Vec<u8>)> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(op_code);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame)?;
    stream.flush()?;

    let mut head = [0u8; 5];
    stream.read_exact(&mut head)?;
    let len = u32::from_le_bytes([head[1], head[2], head[3], head[4]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok((head[0], body))
}
