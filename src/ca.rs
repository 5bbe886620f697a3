//! The ca process holds every TLS private key; the relay only ever
//! sees an opaque key id.  Each handshake signature is a synchronous
//! message exchange on the relay/ca channel.

use crate::{
    config::{purge_key, Id, Relay},
    error::Error,
    message::{Data, KeyOp, Type},
    parent::default_handler,
    Child, Privsep,
};
use privsep::{imsg::Message, process::Peer};
use privsep_log::{debug, info, warn};
use rustls::{
    crypto::aws_lc_rs,
    pki_types::PrivateKeyDer,
    sign::{Signer, SigningKey},
    SignatureAlgorithm, SignatureScheme,
};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;

pub async fn main<const N: usize>(
    child: Child<N>,
    config: privsep::Config,
) -> Result<(), privsep::Error> {
    let _guard = privsep_log::async_logger(&child.to_string(), &config)
        .await
        .map_err(|err| privsep::Error::GeneralError(Box::new(err)))?;

    let child = Arc::new(child);

    info!("Started");

    let mut engine = Engine::default();

    loop {
        tokio::select! {
            message = default_handler::<Data<'_>>(&child[Privsep::PARENT_ID]) => {
                match message? {
                    (Message { id: Type::CTL_RESET, .. }, ..) => {
                        engine.shadow.clear();
                    }
                    (Message { id: Type::CFG_RELAY, .. }, _, Data::Relay(relay)) => {
                        engine.shadow.push(relay.into_owned());
                    }
                    (Message { id: Type::CFG_TABLE, .. }, ..)
                    | (Message { id: Type::CFG_HOST, .. }, ..)
                    | (Message { id: Type::CFG_PROTOCOL, .. }, ..)
                    | (Message { id: Type::CFG_RULE, .. }, ..)
                    | (Message { id: Type::CFG_REDIRECT, .. }, ..) => {}
                    (Message { id: Type::CFG_DONE, .. }, ..) => {
                        child[Privsep::PARENT_ID]
                            .send_message(Type::CfgDone.into(), None, &Data::None)
                            .await?;
                    }
                    (Message { id: Type::CTL_START, .. }, ..) => {
                        engine.launch();
                    }
                    (Message { id: Type::CTL_SHUTDOWN, .. }, ..) => {
                        return Ok(());
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }
            message = default_handler::<Data<'_>>(&child[Privsep::RELAY_ID]) => {
                let (message, _, data) = message?;
                match (Type::from(message.id), data) {
                    (typ @ Type::CaPrivEnc, Data::KeyOp(op))
                    | (typ @ Type::CaPrivDec, Data::KeyOp(op)) => {
                        let result = engine.key_op(op);
                        child[Privsep::RELAY_ID]
                            .send_message(typ.into(), None, &Data::KeyOp(result))
                            .await?;
                    }
                    _ => return Err(Error::InvalidMessage.into()),
                }
            }
        }
    }
}

/// Key table of the ca process.
#[derive(Default)]
struct Engine {
    /// Relay configs collected until the start barrier.
    shadow: Vec<Relay>,
    keys: HashMap<Id, Arc<dyn SigningKey>>,
}

impl Engine {
    /// Load the private keys out of the collected relay configs and
    /// wipe the PEM blobs; runs at the start barrier.
    fn launch(&mut self) {
        self.keys.clear();
        for relay in &mut self.shadow {
            if let Some(pem) = relay.ssl_key.take() {
                match load_key(&pem) {
                    Ok(key) => {
                        debug!("loaded private key"; "keyid" => relay.ssl_keyid);
                        self.keys.insert(relay.ssl_keyid, key);
                    }
                    Err(err) => {
                        warn!("relay {}: cannot load key: {}", relay.name, err);
                    }
                }
                let mut pem = Some(pem);
                purge_key(&mut pem);
            }
            if let Some(pem) = relay.ssl_cakey.take() {
                match load_key(&pem) {
                    Ok(key) => {
                        self.keys.insert(relay.ssl_cakeyid, key);
                    }
                    Err(err) => {
                        warn!("relay {}: cannot load ca key: {}", relay.name, err);
                    }
                }
                let mut pem = Some(pem);
                purge_key(&mut pem);
            }
        }
    }

    /// Perform one private key operation.  Unknown ids, oversized
    /// input and crypto failures all produce an empty result; the
    /// relay turns that into a handshake failure.
    fn key_op(&self, mut op: KeyOp) -> KeyOp {
        let scheme = SignatureScheme::from(op.scheme);
        let result = self
            .keys
            .get(&op.id)
            .and_then(|key| key.choose_scheme(&[scheme]))
            .and_then(|signer| signer.sign(&op.data).ok());
        op.data = match result {
            Some(data) => data,
            None => {
                warn!("key operation failed"; "keyid" => op.id);
                Vec::new()
            }
        };
        op
    }
}

fn load_key(pem: &[u8]) -> Result<Arc<dyn SigningKey>, Error> {
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &pem[..])?
        .ok_or_else(|| Error::ConfigError("no private key in blob".to_string()))?;
    aws_lc_rs::sign::any_supported_type(&key).map_err(Error::Tls)
}

//
// Relay-side engine: a rustls signing key whose operations are
// messages to the ca process.
//

/// One queued key operation with its reply slot.
pub struct CaRequest {
    pub typ: Type,
    pub op: KeyOp,
    pub reply: std::sync::mpsc::SyncSender<Vec<u8>>,
}

pub type CaSender = mpsc::UnboundedSender<CaRequest>;

/// Serializes key operations onto the ca channel.  The channel is
/// strictly request/reply, so one task owns both directions.
pub async fn ca_client<const N: usize>(
    child: Arc<Child<N>>,
    mut requests: mpsc::UnboundedReceiver<CaRequest>,
) {
    let peer = &child[Privsep::CA_ID];
    while let Some(request) = requests.recv().await {
        let result = key_op(peer, request.typ, request.op)
            .await
            .unwrap_or_default();
        // The signer may have timed out and dropped the slot.
        let _ = request.reply.send(result);
    }
}

async fn key_op(peer: &Peer, typ: Type, op: KeyOp) -> Result<Vec<u8>, Error> {
    peer.send_message(typ.into(), None, &Data::KeyOp(op)).await?;
    match peer.recv_message::<Data<'_>>().await? {
        Some((_, _, Data::KeyOp(result))) => Ok(result.data),
        _ => Err(Error::KeyOpFailed),
    }
}

/// The supported key type of the engine is RSA, like the original's
/// custom RSA method; the public half lives in the certificate.
const RSA_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::RSA_PSS_SHA512,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PKCS1_SHA512,
    SignatureScheme::RSA_PKCS1_SHA384,
    SignatureScheme::RSA_PKCS1_SHA256,
];

#[derive(Debug)]
pub struct RemoteKey {
    id: Id,
    ca: CaSender,
}

impl RemoteKey {
    pub fn new(id: Id, ca: CaSender) -> Self {
        Self { id, ca }
    }
}

impl SigningKey for RemoteKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        offered
            .iter()
            .copied()
            .find(|scheme| RSA_SCHEMES.contains(scheme))
            .map(|scheme| {
                Box::new(RemoteSigner {
                    id: self.id,
                    ca: self.ca.clone(),
                    scheme,
                }) as Box<dyn Signer>
            })
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::RSA
    }
}

#[derive(Debug)]
struct RemoteSigner {
    id: Id,
    ca: CaSender,
    scheme: SignatureScheme,
}

impl Signer for RemoteSigner {
    /// The single blocking point of the relay: the TLS library insists
    /// on a synchronous signature, so the calling task parks on the
    /// reply slot until the ca answers or the timeout fires.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        let (reply, result) = std::sync::mpsc::sync_channel(1);
        let request = CaRequest {
            typ: Type::CaPrivEnc,
            op: KeyOp {
                id: self.id,
                scheme: u16::from(self.scheme),
                data: message.to_vec(),
            },
            reply,
        };
        self.ca
            .send(request)
            .map_err(|_| rustls::Error::General("ca channel closed".to_string()))?;
        match result.recv_timeout(crate::CA_TIMEOUT) {
            Ok(data) if !data.is_empty() => Ok(data),
            _ => Err(rustls::Error::General(
                "ca key operation failed".to_string(),
            )),
        }
    }

    fn scheme(&self) -> SignatureScheme {
        self.scheme
    }
}
