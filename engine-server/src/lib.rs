//! The issuance engine's TCP server: binds the decision core
//! (`certissue-engine`) to a listen socket via the single-writer thread
//! model spec section 9 recommends — one decision thread fed by a bounded
//! queue, one thread per connection feeding it and writing replies back in
//! the order they were read.

use certissue_engine::{ClassConfig, DecisionError, Engine, GrantError};
use certissue_journal::Journal;
use certissue_logging::{debug, error, info, Logger};
use certissue_wire::{ErrorCode, GrantReply, GrantRequest};
use serde::Deserialize;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub journal_path: PathBuf,
    pub classes: Vec<ClassConfig>,
    #[serde(default)]
    pub log: certissue_logging::LogConfig,
}

struct DecisionRequest {
    class_tag: String,
    holder_name: String,
    amount: u32,
    reply: mpsc::Sender<Reply>,
}

enum Reply {
    Ok(u64),
    Rejected(GrantError),
    /// The engine hit a fatal journal error while processing (or while a
    /// request sat queued behind one that did). The connection is closed
    /// without a wire reply, matching spec section 4.1's framing-fatal
    /// treatment of unrecoverable errors.
    Fatal,
}

/// Recover engine state from the journal at `journal_path`, replaying it
/// against `classes`. Returns the ready `Engine` and open `Journal`.
pub fn recover(
    classes: &[ClassConfig],
    journal_path: &PathBuf,
) -> Result<(Engine, Journal), String> {
    let (journal, records) =
        Journal::open(journal_path).map_err(|e| format!("journal open failed: {e}"))?;
    let engine = Engine::recover(classes, &records).map_err(|e| format!("{e}"))?;
    Ok((engine, journal))
}

/// Run the decision thread: the sole owner of `engine` and `journal` for
/// the lifetime of the process. Exits the process on a fatal journal
/// error, after flushing fatal replies to every request already queued.
fn run_decision_thread(mut engine: Engine, mut journal: Journal, rx: mpsc::Receiver<DecisionRequest>, log: Logger) {
    for req in rx.iter() {
        match engine.grant(&mut journal, &req.class_tag, &req.holder_name, req.amount) {
            Ok(certificate_number) => {
                let _ = req.reply.send(Reply::Ok(certificate_number));
            }
            Err(DecisionError::Rejected(reason)) => {
                let _ = req.reply.send(Reply::Rejected(reason));
            }
            Err(DecisionError::JournalFault(e)) => {
                error!(log, "fatal journal error, shutting down"; "error" => %e);
                let _ = req.reply.send(Reply::Fatal);
                while let Ok(pending) = rx.try_recv() {
                    let _ = pending.reply.send(Reply::Fatal);
                }
                std::process::exit(1);
            }
        }
    }
}

/// Accept connections on `listener` forever, spawning one handler thread
/// per connection. Returns only if the listener itself errors out.
pub fn serve(listener: TcpListener, engine: Engine, journal: Journal, log: Logger) -> io::Result<()> {
    let (tx, rx) = mpsc::channel::<DecisionRequest>();
    let decision_log = log.clone();
    thread::spawn(move || run_decision_thread(engine, journal, rx, decision_log));

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                error!(log, "accept failed"; "error" => %e);
                continue;
            }
        };
        let peer = stream.peer_addr().ok();
        let tx = tx.clone();
        let conn_log = log.clone();
        thread::spawn(move || {
            debug!(conn_log, "connection accepted"; "peer" => ?peer);
            handle_connection(stream, tx, &conn_log);
            debug!(conn_log, "connection closed"; "peer" => ?peer);
        });
    }

    Ok(())
}

fn handle_connection(mut stream: TcpStream, tx: mpsc::Sender<DecisionRequest>, log: &Logger) {
    let _ = stream.set_nodelay(true);
    loop {
        let request = match GrantRequest::read_frame(&mut stream) {
            Ok(req) => req,
            Err(certissue_wire::Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return; // Clean client EOF.
            }
            Err(e) => {
                debug!(log, "malformed frame, closing connection"; "error" => ?e);
                return;
            }
        };

        let (reply_tx, reply_rx) = mpsc::channel();
        if tx
            .send(DecisionRequest {
                class_tag: request.class_tag,
                holder_name: request.holder_name,
                amount: request.amount,
                reply: reply_tx,
            })
            .is_err()
        {
            return; // Decision thread gone.
        }

        let reply = match reply_rx.recv() {
            Ok(r) => r,
            Err(_) => return,
        };

        let wire_reply = match reply {
            Reply::Ok(n) => GrantReply::Ok(n),
            Reply::Rejected(GrantError::UnknownClass) => GrantReply::Err(ErrorCode::UnknownClass),
            Reply::Rejected(GrantError::InvalidAmount) => GrantReply::Err(ErrorCode::InvalidAmount),
            Reply::Rejected(GrantError::InsufficientShares) => {
                GrantReply::Err(ErrorCode::InsufficientShares)
            }
            Reply::Rejected(GrantError::Malformed) => GrantReply::Err(ErrorCode::Malformed),
            Reply::Fatal => return,
        };

        if wire_reply.write_frame(&mut stream).is_err() {
            return;
        }
    }
}

pub fn info_startup(log: &Logger, addr: SocketAddr, classes: &[ClassConfig]) {
    info!(log, "engine starting";
        "listen_addr" => %addr,
        "classes" => classes.len());
}
