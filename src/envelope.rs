use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose;
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::error::EnvelopeError;
use crate::task::{Task, Work};

/// Version of the envelope wire contract. Bumped on incompatible changes;
/// `open` rejects blobs sealed with any other version.
pub const ENVELOPE_VERSION: u16 = 1;

/// The encoding half of a portable task variant.
///
/// Portability is an explicit, versioned contract per task kind: each kind
/// names itself, encodes its own payload, and registers a matching decoder in
/// a [`Registry`]. Nothing is derived from incidental field layout.
pub trait Portable: Send + Sync {
    /// The registered kind string of this task variant.
    fn kind(&self) -> &'static str;

    /// Encodes the work parameters into a payload the registered decoder can
    /// reconstruct from.
    fn encode(&self) -> anyhow::Result<Vec<u8>>;
}

/// Work which can travel: executable and encodable.
pub trait PortableWork<R>: Work<R> + Portable {}

impl<R, T> PortableWork<R> for T where T: Work<R> + Portable {}

/// Encodes a serde value as a CBOR payload. The conventional payload codec
/// for [`Portable::encode`] implementations.
pub fn encode_payload<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Decodes a CBOR payload produced by [`encode_payload`].
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> anyhow::Result<T> {
    Ok(ciborium::from_reader(payload)?)
}

type DecodeFn<R> = Box<dyn Fn(&[u8]) -> anyhow::Result<Arc<dyn PortableWork<R>>> + Send + Sync>;

/// Maps task kind strings to payload decoders.
///
/// The receiving side of a distributed queue holds one registry covering
/// every task kind it is willing to run; an envelope naming an unregistered
/// kind is rejected rather than guessed at.
pub struct Registry<R> {
    decoders: HashMap<&'static str, DecodeFn<R>>,
}

impl<R> Registry<R> {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Registers a decoder for one task kind. The decoder receives the raw
    /// payload bytes and rebuilds the concrete work value.
    pub fn register<W, F>(&mut self, kind: &'static str, decode: F)
    where
        W: PortableWork<R> + 'static,
        F: Fn(&[u8]) -> anyhow::Result<W> + Send + Sync + 'static,
    {
        self.decoders.insert(
            kind,
            Box::new(move |payload| Ok(Arc::new(decode(payload)?) as Arc<dyn PortableWork<R>>)),
        );
    }

    fn decode(&self, kind: &str, payload: &[u8]) -> Result<Arc<dyn PortableWork<R>>, EnvelopeError> {
        let decoder = self
            .decoders
            .get(kind)
            .ok_or_else(|| EnvelopeError::UnknownKind(kind.to_string()))?;

        decoder(payload).map_err(|err| EnvelopeError::Decode {
            kind: kind.to_string(),
            source: err,
        })
    }
}

impl<R> Default for Registry<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// The portable serialized form of a task tree.
///
/// Only what a remote worker needs to reproduce the `execute` behavior is
/// carried: names, phase metadata, the configured timeout, the child ordering
/// mode, kinds and payloads, recursively over the owned children. Callbacks,
/// counters, exception handlers, live dependency handles and armed deadline
/// instants are run-local and excluded by construction; a reconstructed task
/// always starts with fresh run-local state.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u16,
    pub root: EnvelopeNode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EnvelopeNode {
    pub name: String,
    pub phase: u32,
    pub dependent_phase: u32,
    /// Configured timeout in milliseconds; zero means no deadline. The armed
    /// deadline instant is run-local and never carried.
    pub timeout_ms: u64,
    pub run_children_first: bool,
    pub kind: String,
    pub payload: Vec<u8>,
    pub children: Vec<EnvelopeNode>,
}

fn to_node<R>(task: &Task<R>) -> Result<EnvelopeNode, EnvelopeError> {
    let work = task
        .work
        .portable()
        .ok_or_else(|| EnvelopeError::NotPortable(task.name.clone()))?;

    let payload = work.encode().map_err(|err| EnvelopeError::Encode {
        task: task.name.clone(),
        source: err,
    })?;

    let children = task
        .children
        .iter()
        .map(to_node)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(EnvelopeNode {
        name: task.name.clone(),
        phase: task.phase,
        dependent_phase: task.dependent_phase,
        timeout_ms: task.timeout.as_millis() as u64,
        run_children_first: task.run_children_first,
        kind: work.kind().to_string(),
        payload,
        children,
    })
}

fn from_node<R>(node: EnvelopeNode, registry: &Registry<R>) -> Result<Task<R>, EnvelopeError> {
    let work = registry.decode(&node.kind, &node.payload)?;
    let mut task = Task::from_decoded(node.name, work)
        .with_phase(node.phase, node.dependent_phase)
        .with_timeout(Duration::from_millis(node.timeout_ms))
        .with_run_children_first(node.run_children_first);

    for child in node.children {
        task = task.with_child(from_node(child, registry)?);
    }

    Ok(task)
}

/// Seals a task tree into a compact, compressed, transport-safe blob:
/// CBOR, deflated, base64.
pub fn seal<R>(task: &Task<R>) -> Result<String, EnvelopeError> {
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        root: to_node(task)?,
    };

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    ciborium::into_writer(&envelope, &mut encoder).map_err(|err| EnvelopeError::Encode {
        task: envelope.root.name.clone(),
        source: anyhow::Error::new(err),
    })?;
    let compressed = encoder.finish()?;

    Ok(general_purpose::STANDARD.encode(compressed))
}

/// Opens a sealed blob back into a runnable task tree.
pub fn open<R>(blob: &str, registry: &Registry<R>) -> Result<Task<R>, EnvelopeError> {
    let compressed = general_purpose::STANDARD
        .decode(blob)
        .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;

    let mut cbor = Vec::new();
    DeflateDecoder::new(compressed.as_slice()).read_to_end(&mut cbor)?;

    let envelope: Envelope = ciborium::from_reader(cbor.as_slice())
        .map_err(|err| EnvelopeError::Malformed(err.to_string()))?;

    if envelope.version != ENVELOPE_VERSION {
        return Err(EnvelopeError::Version {
            found: envelope.version,
            expected: ENVELOPE_VERSION,
        });
    }

    from_node(envelope.root, registry)
}
