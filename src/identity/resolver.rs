//! Worker identity reconciliation.
//!
//! Decides whether this host is the same worker as before or must register as a new one.
//! The decision is a pure function of the probed instance id and the persisted record
//! ([`plan`]); [`WorkerIdentityResolver`] executes it against the registrar and the store.

use std::sync::Arc;
use std::time::Duration;

use crate::control_plane::{WorkerRegistrar, with_deadline};
use crate::error::IdentityError;
use crate::identity::probe::InstanceIdentityProbe;
use crate::identity::state::{WorkerState, WorkerStateStore};
use crate::ids::{InstanceId, WorkerId};

/// What to do with a `(probe, state)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No record: register and bind whatever the probe reported.
    RegisterFresh { instance_id: Option<InstanceId> },
    /// Record has no instance binding and the probe found one: keep the id, bind it.
    BindInstance {
        worker_id: WorkerId,
        instance_id: InstanceId,
    },
    /// Record has no instance binding and the probe found nothing.
    ReuseUnbound { worker_id: WorkerId },
    /// Record is bound but the probe could not verify it; assume continuity.
    ReuseUnverified {
        worker_id: WorkerId,
        recorded_instance: InstanceId,
    },
    /// Record is bound to the instance the probe reported.
    ReuseConfirmed {
        worker_id: WorkerId,
        instance_id: InstanceId,
    },
    /// Record is bound to a different instance: this host is a clone or was re-imaged.
    ReplaceCloned {
        stale_worker_id: WorkerId,
        recorded_instance: InstanceId,
        detected_instance: InstanceId,
    },
}

impl Resolution {
    /// Whether executing this resolution calls the registrar.
    pub fn registers(&self) -> bool {
        matches!(self, Self::RegisterFresh { .. } | Self::ReplaceCloned { .. })
    }
}

/// Choose the branch for a probe result and persisted record.
pub fn plan(probe: Option<InstanceId>, state: Option<WorkerState>) -> Resolution {
    match (state, probe) {
        (None, instance_id) => Resolution::RegisterFresh { instance_id },
        (
            Some(WorkerState {
                worker_id,
                instance_id: None,
            }),
            Some(instance_id),
        ) => Resolution::BindInstance {
            worker_id,
            instance_id,
        },
        (
            Some(WorkerState {
                worker_id,
                instance_id: None,
            }),
            None,
        ) => Resolution::ReuseUnbound { worker_id },
        (
            Some(WorkerState {
                worker_id,
                instance_id: Some(recorded_instance),
            }),
            None,
        ) => Resolution::ReuseUnverified {
            worker_id,
            recorded_instance,
        },
        (
            Some(WorkerState {
                worker_id,
                instance_id: Some(recorded),
            }),
            Some(detected),
        ) if recorded == detected => Resolution::ReuseConfirmed {
            worker_id,
            instance_id: detected,
        },
        (
            Some(WorkerState {
                worker_id,
                instance_id: Some(recorded_instance),
            }),
            Some(detected_instance),
        ) => Resolution::ReplaceCloned {
            stale_worker_id: worker_id,
            recorded_instance,
            detected_instance,
        },
    }
}

/// The identity this agent runs as. Computed once at startup and passed down explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub worker_id: WorkerId,
    /// Instance binding as persisted after resolution.
    pub instance_id: Option<InstanceId>,
    /// Worker id this host used to run as, when it was replaced by a new registration.
    pub previous_worker_id: Option<WorkerId>,
    /// Whether a new worker was registered during this resolution.
    pub registered: bool,
}

/// Runs the startup identity pass.
pub struct WorkerIdentityResolver {
    probe: Arc<dyn InstanceIdentityProbe>,
    registrar: Arc<dyn WorkerRegistrar>,
    store: WorkerStateStore,
    probe_timeout: Duration,
    call_timeout: Duration,
}

impl WorkerIdentityResolver {
    pub fn new(
        probe: Arc<dyn InstanceIdentityProbe>,
        registrar: Arc<dyn WorkerRegistrar>,
        store: WorkerStateStore,
        probe_timeout: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            probe,
            registrar,
            store,
            probe_timeout,
            call_timeout,
        }
    }

    /// Resolve the worker id, registering and persisting as required.
    pub async fn resolve(&self) -> Result<ResolvedIdentity, IdentityError> {
        let probe = self.probe_instance().await;
        let state = self.store.load()?;
        let resolution = plan(probe, state);
        tracing::debug!(?resolution, "Identity resolution planned");

        match resolution {
            Resolution::RegisterFresh { instance_id } => {
                let worker_id = self.register().await?;
                self.persist(&worker_id, instance_id.as_ref())?;
                tracing::info!(worker_id = %worker_id, "Registered new worker");
                Ok(ResolvedIdentity {
                    worker_id,
                    instance_id,
                    previous_worker_id: None,
                    registered: true,
                })
            }
            Resolution::BindInstance {
                worker_id,
                instance_id,
            } => {
                self.persist(&worker_id, Some(&instance_id))?;
                tracing::info!(
                    worker_id = %worker_id,
                    instance_id = %instance_id,
                    "Bound existing worker to instance"
                );
                Ok(ResolvedIdentity {
                    worker_id,
                    instance_id: Some(instance_id),
                    previous_worker_id: None,
                    registered: false,
                })
            }
            Resolution::ReuseUnbound { worker_id } => {
                tracing::info!(worker_id = %worker_id, "Reusing worker id");
                Ok(ResolvedIdentity {
                    worker_id,
                    instance_id: None,
                    previous_worker_id: None,
                    registered: false,
                })
            }
            Resolution::ReuseUnverified {
                worker_id,
                recorded_instance,
            } => {
                tracing::warn!(
                    worker_id = %worker_id,
                    recorded_instance = %recorded_instance,
                    "Instance id could not be verified; assuming continuity"
                );
                Ok(ResolvedIdentity {
                    worker_id,
                    instance_id: Some(recorded_instance),
                    previous_worker_id: None,
                    registered: false,
                })
            }
            Resolution::ReuseConfirmed {
                worker_id,
                instance_id,
            } => {
                tracing::info!(worker_id = %worker_id, instance_id = %instance_id, "Reusing worker id");
                Ok(ResolvedIdentity {
                    worker_id,
                    instance_id: Some(instance_id),
                    previous_worker_id: None,
                    registered: false,
                })
            }
            Resolution::ReplaceCloned {
                stale_worker_id,
                recorded_instance,
                detected_instance,
            } => {
                tracing::warn!(
                    stale_worker_id = %stale_worker_id,
                    recorded_instance = %recorded_instance,
                    detected_instance = %detected_instance,
                    "Worker state belongs to another instance; registering a new worker"
                );
                let worker_id = self.register().await?;
                if worker_id == stale_worker_id {
                    return Err(IdentityError::IdentityConflict {
                        worker_id: worker_id.to_string(),
                        recorded_instance: recorded_instance.to_string(),
                        detected_instance: detected_instance.to_string(),
                    });
                }
                self.persist(&worker_id, Some(&detected_instance))?;
                tracing::info!(worker_id = %worker_id, "Registered replacement worker");
                Ok(ResolvedIdentity {
                    worker_id,
                    instance_id: Some(detected_instance),
                    previous_worker_id: Some(stale_worker_id),
                    registered: true,
                })
            }
        }
    }

    async fn probe_instance(&self) -> Option<InstanceId> {
        match tokio::time::timeout(
            self.probe_timeout,
            self.probe.probe_instance_id(self.probe_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                let err = IdentityError::ProbeTimeout {
                    timeout: self.probe_timeout,
                };
                tracing::warn!(error = %err, "Treating instance id as absent");
                None
            }
        }
    }

    async fn register(&self) -> Result<WorkerId, IdentityError> {
        with_deadline(
            "CreateWorker",
            self.call_timeout,
            self.registrar.register_worker(),
        )
        .await
        .map_err(IdentityError::RegistrationFailed)
    }

    fn persist(
        &self,
        worker_id: &WorkerId,
        instance_id: Option<&InstanceId>,
    ) -> Result<(), IdentityError> {
        self.store
            .save(&WorkerState::new(worker_id.clone(), instance_id.cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use crate::error::ControlPlaneError;

    fn wid(s: &str) -> WorkerId {
        WorkerId::new(s).unwrap()
    }

    fn iid(s: &str) -> InstanceId {
        InstanceId::new(s).unwrap()
    }

    struct FixedProbe(Option<InstanceId>);

    #[async_trait]
    impl InstanceIdentityProbe for FixedProbe {
        async fn probe_instance_id(&self, _timeout: Duration) -> Option<InstanceId> {
            self.0.clone()
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl InstanceIdentityProbe for HangingProbe {
        async fn probe_instance_id(&self, _timeout: Duration) -> Option<InstanceId> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Some(iid("i-never"))
        }
    }

    /// Hands out a fixed sequence of ids, or fails when empty.
    struct SeqRegistrar {
        ids: std::sync::Mutex<Vec<WorkerId>>,
        calls: AtomicUsize,
    }

    impl SeqRegistrar {
        fn new(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                ids: std::sync::Mutex::new(ids.iter().rev().map(|s| wid(s)).collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl WorkerRegistrar for SeqRegistrar {
        async fn register_worker(&self) -> Result<WorkerId, ControlPlaneError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ids
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ControlPlaneError::RequestFailed {
                    operation: "CreateWorker",
                    source: anyhow::anyhow!("service unavailable"),
                })
        }
    }

    fn resolver(
        dir: &TempDir,
        probe: Arc<dyn InstanceIdentityProbe>,
        registrar: Arc<SeqRegistrar>,
    ) -> (WorkerIdentityResolver, WorkerStateStore) {
        let store = WorkerStateStore::new(dir.path().join("worker.json"));
        let resolver = WorkerIdentityResolver::new(
            probe,
            registrar,
            store.clone(),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        (resolver, store)
    }

    // ── plan() branch table ─────────────────────────────────────────

    #[test]
    fn plan_without_state_registers() {
        assert_eq!(
            plan(Some(iid("i-1")), None),
            Resolution::RegisterFresh {
                instance_id: Some(iid("i-1"))
            }
        );
        assert_eq!(
            plan(None, None),
            Resolution::RegisterFresh { instance_id: None }
        );
    }

    #[test]
    fn plan_unbound_state_binds_or_reuses() {
        let state = WorkerState::new(wid("w-1"), None);
        assert_eq!(
            plan(Some(iid("i-9")), Some(state.clone())),
            Resolution::BindInstance {
                worker_id: wid("w-1"),
                instance_id: iid("i-9")
            }
        );
        assert_eq!(
            plan(None, Some(state)),
            Resolution::ReuseUnbound {
                worker_id: wid("w-1")
            }
        );
    }

    #[test]
    fn plan_bound_state_follows_probe() {
        let state = WorkerState::new(wid("w-1"), Some(iid("i-1")));
        assert_eq!(
            plan(None, Some(state.clone())),
            Resolution::ReuseUnverified {
                worker_id: wid("w-1"),
                recorded_instance: iid("i-1")
            }
        );
        assert_eq!(
            plan(Some(iid("i-1")), Some(state.clone())),
            Resolution::ReuseConfirmed {
                worker_id: wid("w-1"),
                instance_id: iid("i-1")
            }
        );
        let replaced = plan(Some(iid("i-2")), Some(state));
        assert!(replaced.registers());
        assert_eq!(
            replaced,
            Resolution::ReplaceCloned {
                stale_worker_id: wid("w-1"),
                recorded_instance: iid("i-1"),
                detected_instance: iid("i-2")
            }
        );
    }

    // ── resolve() ───────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_host_registers_and_persists_instance() {
        let dir = TempDir::new().unwrap();
        let registrar = SeqRegistrar::new(&["w-new"]);
        let (resolver, store) =
            resolver(&dir, Arc::new(FixedProbe(Some(iid("i-123")))), registrar.clone());

        let identity = resolver.resolve().await.unwrap();
        assert_eq!(identity.worker_id, wid("w-new"));
        assert!(identity.registered);
        assert_eq!(
            store.load().unwrap(),
            Some(WorkerState::new(wid("w-new"), Some(iid("i-123"))))
        );
        assert_eq!(registrar.calls(), 1);
    }

    #[tokio::test]
    async fn unbound_worker_is_bound_on_first_probe() {
        let dir = TempDir::new().unwrap();
        let registrar = SeqRegistrar::new(&[]);
        let (resolver, store) =
            resolver(&dir, Arc::new(FixedProbe(Some(iid("i-999")))), registrar.clone());
        store.save(&WorkerState::new(wid("w-1"), None)).unwrap();

        let identity = resolver.resolve().await.unwrap();
        assert_eq!(identity.worker_id, wid("w-1"));
        assert_eq!(
            store.load().unwrap(),
            Some(WorkerState::new(wid("w-1"), Some(iid("i-999"))))
        );
        assert_eq!(registrar.calls(), 0);
    }

    #[tokio::test]
    async fn unverifiable_probe_keeps_record_untouched() {
        let dir = TempDir::new().unwrap();
        let registrar = SeqRegistrar::new(&[]);
        let (resolver, store) = resolver(&dir, Arc::new(FixedProbe(None)), registrar.clone());
        let state = WorkerState::new(wid("w-1"), Some(iid("i-1")));
        store.save(&state).unwrap();

        let identity = resolver.resolve().await.unwrap();
        assert_eq!(identity.worker_id, wid("w-1"));
        assert_eq!(store.load().unwrap(), Some(state));
        assert_eq!(registrar.calls(), 0);
    }

    #[tokio::test]
    async fn cloned_host_registers_replacement() {
        let dir = TempDir::new().unwrap();
        let registrar = SeqRegistrar::new(&["w-2"]);
        let (resolver, store) =
            resolver(&dir, Arc::new(FixedProbe(Some(iid("i-2")))), registrar.clone());
        store
            .save(&WorkerState::new(wid("w-1"), Some(iid("i-1"))))
            .unwrap();

        let identity = resolver.resolve().await.unwrap();
        assert_eq!(identity.worker_id, wid("w-2"));
        assert_eq!(identity.previous_worker_id, Some(wid("w-1")));
        assert_eq!(
            store.load().unwrap(),
            Some(WorkerState::new(wid("w-2"), Some(iid("i-2"))))
        );
    }

    #[tokio::test]
    async fn registration_returning_stale_id_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let registrar = SeqRegistrar::new(&["w-1"]);
        let (resolver, store) =
            resolver(&dir, Arc::new(FixedProbe(Some(iid("i-2")))), registrar);
        let state = WorkerState::new(wid("w-1"), Some(iid("i-1")));
        store.save(&state).unwrap();

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, IdentityError::IdentityConflict { .. }));
        assert_eq!(store.load().unwrap(), Some(state));
    }

    #[tokio::test]
    async fn registration_failure_persists_nothing() {
        let dir = TempDir::new().unwrap();
        let (resolver, store) =
            resolver(&dir, Arc::new(FixedProbe(None)), SeqRegistrar::new(&[]));

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, IdentityError::RegistrationFailed(_)));
        assert_eq!(store.load().unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_state_is_not_treated_as_fresh_host() {
        let dir = TempDir::new().unwrap();
        let registrar = SeqRegistrar::new(&["w-new"]);
        let (resolver, store) = resolver(&dir, Arc::new(FixedProbe(None)), registrar.clone());
        std::fs::write(store.path(), b"not json").unwrap();

        let err = resolver.resolve().await.unwrap_err();
        assert!(matches!(err, IdentityError::StateFileCorrupt { .. }));
        assert_eq!(registrar.calls(), 0);
    }

    #[tokio::test]
    async fn hanging_probe_is_cut_off() {
        let dir = TempDir::new().unwrap();
        let (resolver, store) =
            resolver(&dir, Arc::new(HangingProbe), SeqRegistrar::new(&[]));
        store
            .save(&WorkerState::new(wid("w-1"), Some(iid("i-1"))))
            .unwrap();

        let identity = tokio::time::timeout(Duration::from_secs(5), resolver.resolve())
            .await
            .expect("resolve must not hang")
            .unwrap();
        assert_eq!(identity.worker_id, wid("w-1"));
    }
}
