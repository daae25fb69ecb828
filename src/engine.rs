//! The derivation engine: validation, dispatch and composite assembly behind
//! one entry point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use zeroize::Zeroizing;

use crate::config::EngineConfig;
use crate::crypto::{
    AesKdf, Argon2Kdf, DerivedKey, KdfAlgorithm, KdfParameters, KdfProvider, MasterKey,
    RawKdfParams, aes_kdf, argon2_kdf, build_master_key, keyfile_component,
};
use crate::error::{DerivationError, KdfError};

/// Stateless apart from its configuration, the one-time self-test flag and
/// the permits bounding concurrent memory-hard work. Clones share all of it.
#[derive(Debug, Clone)]
pub struct DerivationEngine {
    config: EngineConfig,
    initialized: Arc<OnceLock<()>>,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    #[cfg(test)]
    peak_in_flight: Arc<AtomicUsize>,
}

impl Default for DerivationEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl DerivationEngine {
    pub fn new(config: EngineConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.permits()));
        Self {
            config,
            initialized: Arc::new(OnceLock::new()),
            permits,
            in_flight: Arc::new(AtomicUsize::new(0)),
            #[cfg(test)]
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs the known-answer tests of both providers.
    ///
    /// Must be called once before deriving; later calls return immediately.
    pub fn init(&self) -> Result<(), KdfError> {
        if self.is_initialized() {
            return Ok(());
        }
        argon2_kdf::self_test()?;
        aes_kdf::self_test()?;
        let _ = self.initialized.set(());
        info!("key derivation self-tests passed");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get().is_some()
    }

    /// Memory-hard derivations currently holding working memory.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> Result<(), KdfError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(KdfError::NotInitialized)
        }
    }

    /// Validates raw header fields against this engine's limits.
    pub fn validate(&self, raw: &RawKdfParams) -> Result<KdfParameters, KdfError> {
        KdfParameters::validate(raw, &self.config.limits).map_err(|e| {
            debug!(algorithm = %raw.algorithm, error = %e, "rejected KDF parameters");
            KdfError::from(e)
        })
    }

    /// Derives the key component for `password`. Blocks for as long as the
    /// parameters demand, plus the wait for a permit when `max_concurrent`
    /// memory-hard derivations are already running.
    ///
    /// Must not be called from an async task; use
    /// [`derive_async`](Self::derive_async) there.
    pub fn derive(&self, password: &[u8], params: &KdfParameters) -> Result<DerivedKey, KdfError> {
        self.ensure_initialized()?;
        let _permit = match params.algorithm() {
            KdfAlgorithm::MemoryHard => Some(futures::executor::block_on(self.acquire())?),
            KdfAlgorithm::LegacyIterative => None,
        };
        self.run(password, params)
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, KdfError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| KdfError::Internal("derivation queue closed".into()))
    }

    /// Dispatches to the provider. Callers hold the permit if one is needed.
    #[instrument(
        skip_all,
        fields(
            algorithm = %params.algorithm(),
            memory_kib = params.memory_kib(),
            iterations = params.iterations()
        )
    )]
    fn run(&self, password: &[u8], params: &KdfParameters) -> Result<DerivedKey, KdfError> {
        let started = Instant::now();
        let result = match params {
            KdfParameters::MemoryHard(p) => {
                let _gauge = InFlight::enter(self);
                Argon2Kdf.derive(password, p)
            }
            KdfParameters::LegacyIterative(p) => AesKdf.derive(password, p),
        };

        match &result {
            Ok(_) => debug!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "key derived"
            ),
            Err(DerivationError::AllocationFailure { requested_kib }) => {
                warn!(requested_kib, "could not reserve KDF working memory")
            }
            Err(DerivationError::InternalError(msg)) => error!(%msg, "key derivation failed"),
        }
        result.map_err(KdfError::from)
    }

    /// Like [`derive`](Self::derive), but on a blocking worker thread.
    ///
    /// Memory-hard derivations wait for a permit first, from the same pool as
    /// the blocking path, so at most `max_concurrent` of them hold working
    /// memory at once across both. Dropping the returned future stops the
    /// wait only: a derivation that has started runs to completion on its
    /// worker, keeps its permit until then, and its result is wiped when
    /// discarded.
    pub async fn derive_async(
        &self,
        password: Zeroizing<Vec<u8>>,
        params: KdfParameters,
    ) -> Result<DerivedKey, KdfError> {
        self.ensure_initialized()?;

        let permit = match params.algorithm() {
            KdfAlgorithm::MemoryHard => Some(self.acquire().await?),
            KdfAlgorithm::LegacyIterative => None,
        };

        let engine = self.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.run(&password, &params)
        })
        .await
        .map_err(|e| KdfError::Internal(format!("derivation worker failed: {e}")))?
    }

    /// Validates, derives and folds in the keyfile component.
    pub fn unlock(
        &self,
        password: &[u8],
        raw: &RawKdfParams,
        keyfile: Option<&[u8]>,
    ) -> Result<MasterKey, KdfError> {
        let params = self.validate(raw)?;
        let derived = self.derive(password, &params)?;
        Ok(compose(derived, keyfile))
    }

    pub async fn unlock_async(
        &self,
        password: Zeroizing<Vec<u8>>,
        raw: &RawKdfParams,
        keyfile: Option<Zeroizing<Vec<u8>>>,
    ) -> Result<MasterKey, KdfError> {
        let params = self.validate(raw)?;
        let derived = self.derive_async(password, params).await?;
        Ok(compose(derived, keyfile.as_deref().map(Vec::as_slice)))
    }
}

/// Counts a running memory-hard derivation until dropped.
struct InFlight<'a> {
    count: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(engine: &'a DerivationEngine) -> Self {
        let now = engine.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(in_flight = now, "memory-hard derivation started");
        #[cfg(test)]
        engine.peak_in_flight.fetch_max(now, Ordering::AcqRel);
        Self {
            count: &engine.in_flight,
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

fn compose(derived: DerivedKey, keyfile: Option<&[u8]>) -> MasterKey {
    let component = keyfile.map(keyfile_component);
    build_master_key(derived, component.as_ref().map(|c| &c[..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, Field};

    fn ready_engine() -> DerivationEngine {
        let engine = DerivationEngine::default();
        engine.init().unwrap();
        engine
    }

    fn small_argon2() -> RawKdfParams {
        RawKdfParams::new(KdfAlgorithm::MemoryHard)
            .with_salt(vec![1u8; 16])
            .with_parallelism(2)
            .with_memory_kib(64)
            .with_iterations(2)
            .with_version(0x13)
            .with_variant(2)
    }

    fn small_aes() -> RawKdfParams {
        RawKdfParams::new(KdfAlgorithm::LegacyIterative)
            .with_salt(vec![1u8; 32])
            .with_iterations(64)
    }

    #[test]
    fn derive_requires_init() {
        let engine = DerivationEngine::default();
        let params = engine.validate(&small_aes()).unwrap();
        assert_eq!(
            engine.derive(b"pw", &params).unwrap_err(),
            KdfError::NotInitialized
        );
    }

    #[test]
    fn init_is_idempotent() {
        let engine = DerivationEngine::default();
        engine.init().unwrap();
        engine.init().unwrap();
        assert!(engine.is_initialized());
        assert!(engine.clone().is_initialized());
    }

    #[test]
    fn dispatches_per_algorithm() {
        let engine = ready_engine();
        let argon = engine.validate(&small_argon2()).unwrap();
        let aes = engine.validate(&small_aes()).unwrap();
        assert_ne!(
            engine.derive(b"pw", &argon).unwrap(),
            engine.derive(b"pw", &aes).unwrap()
        );
    }

    #[test]
    fn validation_errors_keep_their_kind() {
        let engine = ready_engine();
        let err = engine
            .validate(&small_argon2().with_memory_kib(4))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        match err {
            KdfError::Validation(inner) => assert_eq!(inner.field(), Field::MemoryCost),
            other => panic!("expected Validation, got: {other:?}"),
        }

        let err = engine
            .validate(&small_argon2().with_version(0x15))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedVersion);
    }

    #[test]
    fn unlock_with_and_without_keyfile_differ() {
        let engine = ready_engine();
        let raw = small_argon2();
        let plain = engine.unlock(b"pw", &raw, None).unwrap();
        let with_keyfile = engine.unlock(b"pw", &raw, Some(b"keyfile")).unwrap();
        assert_ne!(plain, with_keyfile);
        assert_eq!(plain, engine.unlock(b"pw", &raw, None).unwrap());
    }

    #[tokio::test]
    async fn async_matches_blocking() {
        let engine = ready_engine();
        let params = engine.validate(&small_argon2()).unwrap();
        let blocking = engine.derive(b"pw", &params).unwrap();
        let background = engine
            .derive_async(Zeroizing::new(b"pw".to_vec()), params)
            .await
            .unwrap();
        assert_eq!(blocking, background);
    }

    #[tokio::test]
    async fn queued_derivations_all_complete() {
        let engine = ready_engine();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let engine = engine.clone();
            let params = engine.validate(&small_argon2()).unwrap();
            handles.push(tokio::spawn(async move {
                engine
                    .derive_async(Zeroizing::new(b"pw".to_vec()), params)
                    .await
            }));
        }
        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap().unwrap());
        }
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(engine.permits.available_permits(), 1);
        assert_eq!(engine.peak_in_flight.load(Ordering::Acquire), 1);
        assert_eq!(engine.in_flight(), 0);
    }

    #[test]
    fn blocking_derivations_run_one_at_a_time() {
        let engine = ready_engine();
        let params = engine.validate(&small_argon2()).unwrap();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| engine.derive(b"pw", &params).unwrap());
            }
        });
        assert_eq!(engine.peak_in_flight.load(Ordering::Acquire), 1);
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(engine.permits.available_permits(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_and_async_share_one_bound() {
        let engine = ready_engine();
        let params = engine.validate(&small_argon2()).unwrap();

        let blocking = {
            let engine = engine.clone();
            let params = params.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    engine.derive(b"pw", &params).unwrap();
                }
            })
        };
        for _ in 0..3 {
            engine
                .derive_async(Zeroizing::new(b"pw".to_vec()), params.clone())
                .await
                .unwrap();
        }
        blocking.join().unwrap();

        assert_eq!(engine.peak_in_flight.load(Ordering::Acquire), 1);
    }

    #[test]
    fn configured_concurrency_is_respected() {
        let engine = DerivationEngine::new(EngineConfig {
            max_concurrent: 2,
            ..EngineConfig::default()
        });
        engine.init().unwrap();
        let params = engine.validate(&small_argon2()).unwrap();
        std::thread::scope(|scope| {
            for _ in 0..6 {
                scope.spawn(|| engine.derive(b"pw", &params).unwrap());
            }
        });
        assert!(engine.peak_in_flight.load(Ordering::Acquire) <= 2);
    }

    #[tokio::test]
    async fn unlock_async_matches_unlock() {
        let engine = ready_engine();
        let raw = small_aes();
        let blocking = engine.unlock(b"pw", &raw, Some(b"kf")).unwrap();
        let background = engine
            .unlock_async(
                Zeroizing::new(b"pw".to_vec()),
                &raw,
                Some(Zeroizing::new(b"kf".to_vec())),
            )
            .await
            .unwrap();
        assert_eq!(blocking, background);
    }

    #[tokio::test]
    async fn async_derive_requires_init() {
        let engine = DerivationEngine::default();
        let params = engine.validate(&small_aes()).unwrap();
        assert_eq!(
            engine
                .derive_async(Zeroizing::new(Vec::new()), params)
                .await
                .unwrap_err(),
            KdfError::NotInitialized
        );
    }
}
