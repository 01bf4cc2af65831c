//! Shared fixtures for unit tests: a signing key, a payload builder and a scripted transport

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey};
use sha2::Sha256;

use crate::crypto::keys::{MINCRYPT_KEY_SIZE, MODULUS_SIZE};
use crate::crypto::{Digest, HashPrimitive, Sha256Hash, TrustAnchor};
use crate::fetch::{Request, Stage0Response, Stage1Response, Transport, TransportError};
use crate::format::record::RECORD_SIZE;
use crate::format::{
    GameId, PatchLevel, PatchType, Salt, BODY_OFFSET, INFO_OFFSET, MAGIC, SALT_OFFSET,
    SALT_SIZE, SIGNATURE_SIZE,
};

lazy_static! {
    /// RSA-2048 key that signs test payloads
    pub static ref SIGNING_KEY: TestKey = TestKey::generate();
}

/// Private key standing in for the offline signing tool
pub struct TestKey {
    /// Key pair
    private: RsaPrivateKey,
}

impl TestKey {
    /// Deterministic 2048-bit key
    fn generate() -> Self {
        let mut rng = StdRng::seed_from_u64(0x5757_4643);
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("key generation");
        Self { private }
    }

    /// Anchor that accepts this key's signatures
    pub fn anchor(&self) -> TrustAnchor {
        TrustAnchor::from_public_key(self.private.to_public_key())
    }

    /// PKCS#1 v1.5 signature over a SHA-256 digest
    pub fn sign(&self, digest: &Digest) -> Vec<u8> {
        self.private
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .expect("signing")
    }

    /// Public key in the mincrypt layout
    pub fn mincrypt_blob(&self) -> Vec<u8> {
        let n = self.private.n();
        let n_bytes = n.to_bytes_be();
        assert_eq!(n_bytes.len(), MODULUS_SIZE);
        let rr = (BigUint::from_bytes_be(&[1]) << (2 * MODULUS_SIZE * 8)) % n;
        let mut rr_bytes = vec![0; MODULUS_SIZE];
        let raw = rr.to_bytes_be();
        rr_bytes[MODULUS_SIZE - raw.len()..].copy_from_slice(&raw);

        // -1 / n mod 2^32 by Newton iteration
        let n0 = u32::from_be_bytes(n_bytes[MODULUS_SIZE - 4..].try_into().unwrap());
        let mut inverse = n0;
        for _ in 0..5 {
            inverse = inverse.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inverse)));
        }

        let mut blob = Vec::with_capacity(MINCRYPT_KEY_SIZE);
        blob.extend_from_slice(&inverse.wrapping_neg().to_be_bytes());
        for bytes in [&n_bytes, &rr_bytes] {
            for word in bytes.chunks_exact(4).rev() {
                blob.extend_from_slice(word);
            }
        }
        blob
    }
}

/// Encodes one patch record
pub fn record(
    level: PatchLevel,
    kind: PatchType,
    address: u32,
    arg0: u32,
    arg1: u32,
) -> [u8; RECORD_SIZE] {
    let mut bytes = [0; RECORD_SIZE];
    bytes[0] = level.0;
    bytes[1] = kind as u8;
    bytes[4..8].copy_from_slice(&address.to_be_bytes());
    bytes[8..12].copy_from_slice(&arg0.to_be_bytes());
    bytes[12..16].copy_from_slice(&arg1.to_be_bytes());
    bytes
}

/// Assembles signed payloads
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    /// Target game
    game: GameId,
    /// Session salt
    salt: Salt,
    /// `format_version` and `format_version_compat`
    format: (u32, u32),
    /// Everything after the info block
    body: Vec<u8>,
    /// GOT table
    got: Range<u32>,
    /// Fixup table
    fixup: Range<u32>,
    /// Patch list
    patch_list: Range<u32>,
    /// `entry_point` and `entry_point_no_got`
    entry: (u32, u32),
    /// Minimum total size
    pad_to: usize,
}

impl PayloadBuilder {
    /// Empty payload for `game`
    pub fn new(game: &str) -> Self {
        let body = BODY_OFFSET as u32;
        Self {
            game: GameId::new(game).expect("game id"),
            salt: Salt([0; SALT_SIZE]),
            format: (1, 1),
            body: Vec::new(),
            got: body..body,
            fixup: body..body,
            patch_list: body..body,
            entry: (0, 0),
            pad_to: 0,
        }
    }

    /// Sets the session salt
    pub fn salt(&mut self, salt: Salt) -> &mut Self {
        self.salt = salt;
        self
    }

    /// Sets the format version fields
    pub fn format(&mut self, version: u32, compat: u32) -> &mut Self {
        self.format = (version, compat);
        self
    }

    /// Sets the entry points
    pub fn entry(&mut self, entry_point: u32, entry_point_no_got: u32) -> &mut Self {
        self.entry = (entry_point, entry_point_no_got);
        self
    }

    /// Zero-pads the payload to at least `size` bytes
    pub fn pad_to(&mut self, size: usize) -> &mut Self {
        self.pad_to = size;
        self
    }

    /// Appends `bytes` to the body, returning their payload offset
    pub fn data(&mut self, bytes: &[u8]) -> u32 {
        let offset = (BODY_OFFSET + self.body.len()) as u32;
        self.body.extend_from_slice(bytes);
        offset
    }

    /// Appends big-endian words to the body, returning their range
    fn words(&mut self, words: &[u32]) -> Range<u32> {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        let start = self.data(&bytes);
        start..start + bytes.len() as u32
    }

    /// Appends the GOT
    pub fn got(&mut self, words: &[u32]) -> &mut Self {
        self.got = self.words(words);
        self
    }

    /// Appends the fixup table
    pub fn fixups(&mut self, offsets: &[u32]) -> &mut Self {
        self.fixup = self.words(offsets);
        self
    }

    /// Appends the patch list
    pub fn patches(&mut self, records: &[[u8; RECORD_SIZE]]) -> &mut Self {
        let start = self.data(&records.concat());
        self.patch_list = start..start + (records.len() * RECORD_SIZE) as u32;
        self
    }

    /// Patch list range
    pub fn patch_list(&self) -> Range<u32> {
        self.patch_list.clone()
    }

    /// Payload with a zeroed signature
    pub fn unsigned(&self) -> Vec<u8> {
        let mut bytes = vec![0; BODY_OFFSET];
        bytes.extend_from_slice(&self.body);
        if bytes.len() < self.pad_to {
            bytes.resize(self.pad_to, 0);
        }
        let total_size = bytes.len() as u32;

        bytes[..MAGIC.len()].copy_from_slice(MAGIC);
        bytes[12..16].copy_from_slice(&total_size.to_be_bytes());
        bytes[SALT_OFFSET..SALT_OFFSET + SALT_SIZE].copy_from_slice(&self.salt.0);

        let mut info = Vec::new();
        info.extend_from_slice(&self.format.0.to_be_bytes());
        info.extend_from_slice(&self.format.1.to_be_bytes());
        info.extend_from_slice(self.game.as_raw());
        info.extend_from_slice(&1u32.to_be_bytes());
        for range in [&self.got, &self.fixup, &self.patch_list] {
            info.extend_from_slice(&range.start.to_be_bytes());
            info.extend_from_slice(&range.end.to_be_bytes());
        }
        info.extend_from_slice(&self.entry.0.to_be_bytes());
        info.extend_from_slice(&self.entry.1.to_be_bytes());
        info.extend_from_slice(&[0; 0x18]);
        let mut stamp = [0u8; 0x20];
        stamp[..20].copy_from_slice(b"2024-01-01T00:00:00Z");
        info.extend_from_slice(&stamp);
        bytes[INFO_OFFSET..BODY_OFFSET].copy_from_slice(&info);
        bytes
    }

    /// Payload signed by [`SIGNING_KEY`]
    pub fn build(&self) -> Vec<u8> {
        let mut bytes = self.unsigned();
        resign(&mut bytes);
        bytes
    }
}

/// Replaces the signature of `bytes` with a valid one for its current contents
pub fn resign(bytes: &mut [u8]) {
    let digest = Sha256Hash.digest(&bytes[SALT_OFFSET..]);
    let signature = SIGNING_KEY.sign(&digest);
    bytes[16..16 + SIGNATURE_SIZE].copy_from_slice(&signature);
}

/// Scripted answer to one request
type Responder<T> = Box<dyn FnOnce(&Request) -> Result<T, TransportError> + Send>;

/// Transport that answers from a script and records every request
#[derive(Default)]
pub struct MockTransport {
    /// Stage0 answers, in order
    stage0: Mutex<VecDeque<Responder<Stage0Response>>>,
    /// Stage1 answers, in order
    stage1: Mutex<VecDeque<Responder<Stage1Response>>>,
    /// Every request received
    requests: Mutex<Vec<Request>>,
    /// How long every stage1 request takes to answer
    stage1_delay: Option<Duration>,
}

impl MockTransport {
    /// Transport with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that serves `payload` once, for whatever salt the client sends
    pub fn serving(payload: &PayloadBuilder) -> Self {
        Self::new().serve(payload)
    }

    /// Queues one stage0 and one stage1 answer for `payload`, built with the request's salt
    pub fn serve(self, payload: &PayloadBuilder) -> Self {
        let stage0 = payload.clone();
        let stage1 = payload.clone();
        self.with_stage0_fn(move |request| {
            let bytes = stage0.clone().salt(request.salt).build();
            Ok(Stage0Response::Available {
                digest: Sha256Hash.digest(&bytes[SALT_OFFSET..]),
            })
        })
        .with_stage1_fn(move |request| {
            Ok(Stage1Response::Payload(
                stage1.clone().salt(request.salt).build(),
            ))
        })
    }

    /// Queues a stage0 answer
    pub fn with_stage0(self, response: Result<Stage0Response, TransportError>) -> Self {
        self.with_stage0_fn(move |_| response)
    }

    /// Queues a stage0 answer computed from the request
    pub fn with_stage0_fn(
        self,
        respond: impl FnOnce(&Request) -> Result<Stage0Response, TransportError> + Send + 'static,
    ) -> Self {
        self.stage0.lock().unwrap().push_back(Box::new(respond));
        self
    }

    /// Queues a stage1 answer
    pub fn with_stage1(self, response: Result<Stage1Response, TransportError>) -> Self {
        self.with_stage1_fn(move |_| response)
    }

    /// Queues a stage1 answer computed from the request
    pub fn with_stage1_fn(
        self,
        respond: impl FnOnce(&Request) -> Result<Stage1Response, TransportError> + Send + 'static,
    ) -> Self {
        self.stage1.lock().unwrap().push_back(Box::new(respond));
        self
    }

    /// Queues a stage1 answer in front of the already queued ones
    pub fn waiting_first(self, times: usize) -> Self {
        {
            let mut stage1 = self.stage1.lock().unwrap();
            for _ in 0..times {
                stage1.push_front(Box::new(|_| {
                    Ok(Stage1Response::Waiting { retry_after: None })
                }));
            }
        }
        self
    }

    /// Makes every stage1 request take `delay` before it answers
    pub fn with_stage1_delay(mut self, delay: Duration) -> Self {
        self.stage1_delay = Some(delay);
        self
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn stage0(&self, request: &Request) -> Result<Stage0Response, TransportError> {
        self.requests.lock().unwrap().push(*request);
        let respond = self.stage0.lock().unwrap().pop_front();
        match respond {
            Some(respond) => respond(request),
            None => Err(TransportError::Request("no scripted stage0 answer".into())),
        }
    }

    async fn stage1(
        &self,
        request: &Request,
        _max_size: usize,
    ) -> Result<Stage1Response, TransportError> {
        self.requests.lock().unwrap().push(*request);
        if let Some(delay) = self.stage1_delay {
            tokio::time::sleep(delay).await;
        }
        let respond = self.stage1.lock().unwrap().pop_front();
        match respond {
            Some(respond) => respond(request),
            None => Err(TransportError::Request("no scripted stage1 answer".into())),
        }
    }
}
