//! Control socket: a UNIX stream socket speaking the daemon's message
//! framing.  Each client task decodes frames, hands them to the parent
//! loop and streams the typed reply records back.

use crate::message::{read_frame, write_frame, Data, FrameDecoder, Type};
use privsep_log::{debug, warn};
use std::path::Path;
use tokio::{net::UnixListener, sync::mpsc};

/// One decoded control command with its reply stream.
#[derive(Debug)]
pub struct Request {
    pub typ: Type,
    pub data: Data<'static>,
    pub reply: mpsc::Sender<(Type, Data<'static>)>,
}

/// Only the owner may talk to the daemon.
pub fn restrict(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

pub async fn serve(listener: UnixListener, requests: mpsc::Sender<Request>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(client(stream, requests.clone()));
            }
            Err(err) => {
                warn!("control accept failed: {}", err);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn client(stream: tokio::net::UnixStream, requests: mpsc::Sender<Request>) {
    let (mut read, mut write) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<(Type, Data<'static>)>(64);

    let writer = tokio::spawn(async move {
        while let Some((typ, data)) = reply_rx.recv().await {
            if write_frame(&mut write, typ, &data).await.is_err() {
                return;
            }
        }
    });

    let mut decoder = FrameDecoder::default();
    loop {
        match read_frame(&mut read, &mut decoder).await {
            Ok(Some((typ, data))) => {
                debug!("control request: {}", typ);
                let request = Request {
                    typ,
                    data,
                    reply: reply_tx.clone(),
                };
                if requests.send(request).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                // Protocol violation; drop the client.
                debug!("control client error: {}", err);
                break;
            }
        }
    }
    drop(reply_tx);
    let _ = writer.await;
}
