//! `StreamFile` (agent -> core file reads) and `WriteFile` (core -> agent file writes).
//!
//! Both are keyed by `req_id`, independent of any running command. `StreamFile` requests
//! arrive with `data64: None`; the agent answers with a sequence of `StreamFile` packets
//! carrying chunks, the last one `eof: true`. `WriteFile` is the reverse: the core sends
//! one or more chunks under the same `req_id`, the last one `eof: true`, and the agent acks
//! with a single `Response` once the file is flushed.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use waveshell_proto::Packet;

const STREAM_CHUNK: usize = 32 * 1024;

/// Read `path` and stream it back in `StreamFile` chunks under `req_id`.
pub async fn handle_stream_file_request(req_id: String, path: String, out_tx: mpsc::Sender<Packet>) {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            let _ = out_tx
                .send(Packet::Response {
                    req_id,
                    error: Some(format!("open {path}: {e}")),
                    data: None,
                })
                .await;
            return;
        }
    };

    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        match file.read(&mut buf).await {
            Ok(0) => {
                let _ = out_tx
                    .send(Packet::StreamFile {
                        req_id,
                        path,
                        data64: Some(String::new()),
                        eof: true,
                    })
                    .await;
                break;
            }
            Ok(n) => {
                let eof = n < buf.len();
                let data64 = Some(B64.encode(&buf[..n]));
                if out_tx
                    .send(Packet::StreamFile {
                        req_id: req_id.clone(),
                        path: path.clone(),
                        data64,
                        eof,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
                if eof {
                    break;
                }
            }
            Err(e) => {
                let _ = out_tx
                    .send(Packet::Response {
                        req_id,
                        error: Some(format!("read {path}: {e}")),
                        data: None,
                    })
                    .await;
                break;
            }
        }
    }
}

/// Tracks in-progress `WriteFile` transfers by `req_id`.
#[derive(Default)]
pub struct FileWrites {
    open: Mutex<HashMap<String, tokio::fs::File>>,
}

impl FileWrites {
    pub fn new() -> Self {
        FileWrites::default()
    }

    pub async fn handle_write_file(
        &self,
        req_id: String,
        path: String,
        data64: String,
        eof: bool,
        out_tx: mpsc::Sender<Packet>,
    ) {
        let bytes = match B64.decode(&data64) {
            Ok(b) => b,
            Err(e) => {
                self.open.lock().await.remove(&req_id);
                let _ = out_tx
                    .send(Packet::Response {
                        req_id,
                        error: Some(format!("invalid base64: {e}")),
                        data: None,
                    })
                    .await;
                return;
            }
        };

        let mut open = self.open.lock().await;
        if !open.contains_key(&req_id) {
            match tokio::fs::File::create(&path).await {
                Ok(f) => {
                    open.insert(req_id.clone(), f);
                }
                Err(e) => {
                    drop(open);
                    let _ = out_tx
                        .send(Packet::Response {
                            req_id,
                            error: Some(format!("create {path}: {e}")),
                            data: None,
                        })
                        .await;
                    return;
                }
            }
        }

        let file = open.get_mut(&req_id).expect("just inserted or already present");
        if let Err(e) = file.write_all(&bytes).await {
            open.remove(&req_id);
            drop(open);
            let _ = out_tx
                .send(Packet::Response {
                    req_id,
                    error: Some(format!("write {path}: {e}")),
                    data: None,
                })
                .await;
            return;
        }

        if eof {
            let mut file = open.remove(&req_id).expect("present");
            drop(open);
            let result = file.flush().await;
            let _ = out_tx
                .send(Packet::Response {
                    req_id,
                    error: result.err().map(|e| e.to_string()),
                    data: None,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stream_file_sends_chunks_then_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(8);
        handle_stream_file_request("r1".to_string(), path.to_str().unwrap().to_string(), out_tx).await;

        let mut collected = Vec::new();
        let mut saw_eof = false;
        while let Some(Packet::StreamFile { data64, eof, .. }) = out_rx.recv().await {
            if let Some(d) = data64 {
                collected.extend_from_slice(&B64.decode(&d).unwrap());
            }
            if eof {
                saw_eof = true;
                break;
            }
        }
        assert!(saw_eof);
        assert_eq!(collected, b"hello world");
    }

    #[tokio::test]
    async fn write_file_round_trips_two_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt").to_str().unwrap().to_string();
        let writes = FileWrites::new();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        writes
            .handle_write_file("r1".to_string(), path.clone(), B64.encode("hello "), false, out_tx.clone())
            .await;
        writes
            .handle_write_file("r1".to_string(), path.clone(), B64.encode("world"), true, out_tx)
            .await;

        match out_rx.recv().await {
            Some(Packet::Response { error: None, .. }) => {}
            other => panic!("expected a clean ack, got {other:?}"),
        }
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "hello world");
    }
}
