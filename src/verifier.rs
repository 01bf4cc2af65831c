//! # Verifier
//!
//! Top-level verify-and-apply flow:
//!
//! 1. negotiate with the server ([`FetchProtocol`]), retrying stage1 while it reports waiting
//! 2. parse the header, check the signature over `[salt..total_size)`, the advertised digest
//!    and the session salt
//! 3. only then read the info block and check it targets this game and format
//! 4. relocate the payload if configured, and apply the patch list as one batch
//!
//! The first failure ends the attempt; only the retry loop in step 1 ever retries.

use std::borrow::Cow;

use lazy_static::lazy_static;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::VerifierConfig;
use crate::crypto::{digest_eq, Digest, HashPrimitive, Sha256Hash, SignaturePrimitive, TrustAnchor};
use crate::error::{ConfigError, PayloadError, ProtocolError, TrustError};
use crate::fetch::retry::{self, CancelSignal};
use crate::fetch::{FetchProtocol, Transport};
use crate::format::reloc::relocate;
use crate::format::{
    self, iterate_patches, GameId, PatchRecords, PayloadHeader, PayloadInfo, Salt, INFO_OFFSET,
};
use crate::patcher::{AddressSpace, ApplySummary, PatchEngine, PayloadImage};

lazy_static! {
    /// Held for the whole of every attempt; attempts in one process never overlap
    static ref SINGLE_FLIGHT: Mutex<()> = Mutex::new(());
}

/// A payload that passed every check
#[derive(Debug, Clone)]
pub struct VerifiedPayload<'p> {
    /// Raw payload bytes
    bytes: &'p [u8],
    /// Parsed header
    header: PayloadHeader,
    /// Parsed info block
    info: PayloadInfo,
    /// SHA-256 of the signed region
    digest: Digest,
}

impl<'p> VerifiedPayload<'p> {
    /// Raw payload bytes
    pub fn bytes(&self) -> &'p [u8] {
        self.bytes
    }

    /// Parsed header
    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    /// Parsed info block
    pub fn info(&self) -> &PayloadInfo {
        &self.info
    }

    /// Digest of the signed region
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Patch records of the unrelocated payload
    pub fn records(&self) -> Result<PatchRecords<'p>, PayloadError> {
        Ok(iterate_patches(self.bytes, self.info.patch_list.clone())?)
    }
}

/// Result of a successful attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    /// Info block of the applied payload
    pub info: PayloadInfo,
    /// Digest of the signed region
    pub digest: Digest,
    /// What the patch engine did
    pub summary: ApplySummary,
    /// Address the host should call into, if it runs payload code
    pub entry_point: u32,
}

/// Fetches, authenticates and applies payloads for one game
pub struct PayloadVerifier<H = Sha256Hash, S = TrustAnchor> {
    /// Settings
    config: VerifierConfig,
    /// Game from the configuration
    game: GameId,
    /// Digest the stage0 answer must advertise, if pinned
    pinned: Option<Digest>,
    /// Hash capability
    hash: H,
    /// Signature capability
    signature: S,
    /// Patch engine built from the configuration
    engine: PatchEngine,
}

impl PayloadVerifier {
    /// Verifier using SHA-256 and the embedded key of the configured environment
    pub fn from_config(config: VerifierConfig) -> Result<Self, ConfigError> {
        let anchor =
            TrustAnchor::for_environment(config.environment).map_err(|e| ConfigError::Invalid {
                field: "environment",
                reason: e.to_string(),
            })?;
        Self::new(config, Sha256Hash, anchor)
    }
}

impl<H: HashPrimitive, S: SignaturePrimitive> PayloadVerifier<H, S> {
    /// Verifier with explicit hash and signature capabilities
    pub fn new(config: VerifierConfig, hash: H, signature: S) -> Result<Self, ConfigError> {
        config.validate()?;
        let game = config.game_id()?;
        let pinned = config.pinned_digest()?;
        let engine = PatchEngine::new(config.arch.encoder())
            .with_mask(config.patch_levels.mask())
            .with_regions(config.regions());
        Ok(Self {
            config,
            game,
            pinned,
            hash,
            signature,
            engine,
        })
    }

    /// Settings in effect
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Patch engine in effect
    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    /// HTTP transport for the configured domain
    #[cfg(feature = "http")]
    pub fn http_transport(
        &self,
    ) -> Result<crate::fetch::http::HttpTransport, crate::fetch::TransportError> {
        crate::fetch::http::HttpTransport::new(self.config.domain())
    }

    /// Runs one complete attempt against `space`
    ///
    /// Concurrent calls within the process wait for each other.
    pub async fn run<A: AddressSpace + ?Sized>(
        &self,
        transport: &dyn Transport,
        space: &mut A,
        mut cancel: CancelSignal,
    ) -> Result<VerifyOutcome, PayloadError> {
        let _flight = SINGLE_FLIGHT.lock().await;
        let started = Instant::now();

        let salt = Salt::random()
            .map_err(|e| ProtocolError::MakeRequest(format!("no session salt: {e}")))?;
        let mut fetch = FetchProtocol::new(transport, self.game, salt)
            .with_max_payload_size(self.config.max_payload_size)
            .with_request_timeout(self.config.request_timeout())
            .with_cancel(cancel.clone())
            .with_deadline(self.config.retry.deadline_from(started));

        let advertised = fetch.stage0().await?;
        if let Some(pinned) = &self.pinned {
            if !digest_eq(pinned, &advertised) {
                return Err(fetch.fail(TrustError::DigestMismatch));
            }
        }

        let bytes = self.fetch_stage1(&mut fetch, &mut cancel, started).await?;
        let outcome = self
            .verify_payload(&bytes, &salt, Some(&advertised))
            .and_then(|payload| self.apply(&payload, space));
        match outcome {
            Ok(outcome) => {
                info!(
                    game = %self.game,
                    applied = outcome.summary.applied,
                    skipped = outcome.summary.skipped,
                    "payload applied"
                );
                Ok(outcome)
            }
            Err(e) => Err(fetch.fail(e)),
        }
    }

    /// Stage1 with backoff while the server is preparing the payload
    async fn fetch_stage1(
        &self,
        fetch: &mut FetchProtocol<'_>,
        cancel: &mut CancelSignal,
        started: Instant,
    ) -> Result<Vec<u8>, PayloadError> {
        let mut backoff = self.config.retry.backoff_since(started);
        loop {
            match fetch.stage1().await {
                Err(e) if e.is_retryable() => {
                    let Some(delay) = backoff.next_delay(fetch.retry_after()) else {
                        return Err(fetch.fail(ProtocolError::TimedOut));
                    };
                    debug!(attempt = backoff.attempts(), ?delay, "payload not ready, retrying");
                    if let Err(e) = retry::sleep(delay, cancel).await {
                        return Err(fetch.fail(e));
                    }
                }
                result => return result,
            }
        }
    }

    /// Authenticates a received payload against the session `salt`
    ///
    /// Nothing inside the signed region is interpreted before the signature has been checked.
    pub fn verify_payload<'p>(
        &self,
        bytes: &'p [u8],
        salt: &Salt,
        advertised: Option<&Digest>,
    ) -> Result<VerifiedPayload<'p>, PayloadError> {
        let header = format::parse(bytes)?;

        let digest = self.hash.digest(header.signed_region(bytes));
        self.signature.verify(&digest, &header.signature)?;
        if let Some(advertised) = advertised {
            if !digest_eq(&digest, advertised) {
                return Err(TrustError::DigestMismatch.into());
            }
        }
        if !header.salt.ct_eq(salt) {
            return Err(TrustError::SaltMismatch.into());
        }

        let info = format::parse_info(bytes, INFO_OFFSET)?;
        info.check_game(&self.game)?;
        info.check_format()?;
        for record in iterate_patches(bytes, info.patch_list.clone())? {
            record?;
        }
        debug!(
            game = %info.name,
            version = info.version,
            built = %info.build_timestamp,
            "payload verified"
        );

        Ok(VerifiedPayload {
            bytes,
            header,
            info,
            digest,
        })
    }

    /// Relocates (if configured) and applies a verified payload as one batch
    pub fn apply<A: AddressSpace + ?Sized>(
        &self,
        payload: &VerifiedPayload<'_>,
        space: &mut A,
    ) -> Result<VerifyOutcome, PayloadError> {
        let load_address = self.config.load_address;
        let image: Cow<'_, [u8]> = match load_address {
            Some(base) => Cow::Owned(relocate(payload.bytes, &payload.info, base)?),
            None => Cow::Borrowed(payload.bytes),
        };
        let payload_image = match load_address {
            Some(base) => PayloadImage::loaded(&image, base),
            None => PayloadImage::unloaded(&image),
        };
        let records = iterate_patches(&image, payload.info.patch_list.clone())?;
        let summary = self.engine.apply(space, &payload_image, records)?;

        Ok(VerifyOutcome {
            info: payload.info.clone(),
            digest: payload.digest,
            summary,
            entry_point: payload.info.entry(load_address),
        })
    }
}
