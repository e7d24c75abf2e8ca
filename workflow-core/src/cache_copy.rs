use crate::blacklist::{extract_blacklist_prefix, BlacklistCache};
use crate::error::{BlacklistSkipReason, WorkflowError};
use crate::events::{CopyingOutputsFailedResponse, JobAbortedResponse, JobSucceededResponse};
use crate::io_client::{IoClient, IoResponse};
use crate::types::*;
use futures::future::join_all;
use std::collections::BTreeMap;

/// Request to copy a prior call's outputs into this call's job directory,
/// instead of executing it.
pub struct CopyOutputsCommand {
    pub key: ExecutionKey,
    pub simpletons: Vec<Simpleton>,
    /// This call's own detritus paths, known ahead of the copy (destination
    /// side of every detritus key except `CallRootPathKey`, which is derived
    /// from `destination_call_root`).
    pub job_detritus_files: BTreeMap<String, String>,
    pub destination_call_root: String,
    pub cache_hit: CacheHit,
    pub return_code: i32,
}

/// Optional, non-default behavior a backend may plug into a copy attempt.
/// Kept as a capability trait rather than a base class to override: a
/// backend that has nothing special to offer just uses the blanket
/// `NoopHooks` implementation below.
pub trait CacheCopyHooks: Send + Sync {
    /// Server-side copy or same-bucket rename shortcut. `Some(Ok(()))` means
    /// the copy already happened; `Some(Err(_))` is a hard failure; `None`
    /// falls through to the I/O broker.
    fn duplicate(&self, _source_dest_pairs: &[(String, String)]) -> Option<crate::error::Result<()>> {
        None
    }

    /// Extra command sets dispatched after the primary copy set succeeds
    /// (e.g. a cache-freshness `Touch`).
    fn additional_io_commands(&self, _cache_hit: &CacheHit) -> Vec<Vec<IoCommand>> {
        Vec::new()
    }
}

pub struct NoopHooks;
impl CacheCopyHooks for NoopHooks {}

enum FsmState {
    Idle,
    WaitingForIoResponses,
    FailedState,
}

/// Result of running a cache-hit copy attempt to completion.
pub enum CacheCopyOutcome {
    Succeeded(JobSucceededResponse),
    Failed(CopyingOutputsFailedResponse),
    Aborted(JobAbortedResponse),
}

/// Per-call cache-hit copy worker. One instance handles exactly one
/// `CopyOutputsCommand` from `Idle` through to a terminal outcome; it is not
/// reused across attempts.
pub struct CacheCopyFsm<'a> {
    io: &'a dyn IoClient,
    blacklist: &'a BlacklistCache,
    hooks: &'a dyn CacheCopyHooks,
    attempt: u32,
    state: FsmState,
}

impl<'a> CacheCopyFsm<'a> {
    pub fn new(io: &'a dyn IoClient, blacklist: &'a BlacklistCache, hooks: &'a dyn CacheCopyHooks, attempt: u32) -> Self {
        Self { io, blacklist, hooks, attempt, state: FsmState::Idle }
    }

    /// Run the whole attempt. Abort is checked only at entry, matching the
    /// "no mid-flight abort" rule — once I/O is dispatched the attempt runs
    /// to completion or failure.
    pub async fn run(mut self, cmd: CopyOutputsCommand, aborted: impl Fn() -> bool) -> CacheCopyOutcome {
        if aborted() {
            return CacheCopyOutcome::Aborted(JobAbortedResponse { key: cmd.key });
        }

        if self.blacklist.hit_status(&cmd.cache_hit.id) == BlacklistStatus::Bad {
            return self.immediate_skip(cmd, BlacklistSkipReason::HitBlacklisted);
        }

        let Some(source_call_root) = cmd.cache_hit.source_call_root.clone() else {
            return CacheCopyOutcome::Failed(CopyingOutputsFailedResponse {
                key: cmd.key,
                attempt: self.attempt,
                failure: WorkflowError::MissingDetritusKey(detritus_key::CALL_ROOT_PATH.to_string()).to_string(),
            });
        };

        let bucket = extract_blacklist_prefix(&source_call_root);
        if self.blacklist.bucket_status(&bucket) == BlacklistStatus::Bad {
            return self.immediate_skip(cmd, BlacklistSkipReason::BucketBlacklisted);
        }

        let (copy_commands, new_outputs, new_detritus) = match self.plan(&cmd, &source_call_root) {
            Ok(plan) => plan,
            Err(e) => {
                return CacheCopyOutcome::Failed(CopyingOutputsFailedResponse {
                    key: cmd.key,
                    attempt: self.attempt,
                    failure: e.to_string(),
                })
            }
        };

        let source_dest_pairs: Vec<(String, String)> = copy_commands
            .iter()
            .filter_map(|c| match c {
                IoCommand::Copy { src, dst } => Some((src.clone(), dst.clone())),
                IoCommand::Touch { .. } => None,
            })
            .collect();

        if let Some(result) = self.hooks.duplicate(&source_dest_pairs) {
            return match result {
                Ok(()) => self.succeed(cmd, new_outputs, new_detritus),
                Err(e) => CacheCopyOutcome::Failed(CopyingOutputsFailedResponse {
                    key: cmd.key,
                    attempt: self.attempt,
                    failure: e.to_string(),
                }),
            };
        }

        let mut command_sets: Vec<Vec<IoCommand>> = vec![copy_commands];
        command_sets.extend(self.hooks.additional_io_commands(&cmd.cache_hit));

        self.state = FsmState::WaitingForIoResponses;
        for set in command_sets {
            match self.drain_set(cmd.key.clone(), cmd.cache_hit.id.clone(), set).await {
                Ok(()) => continue,
                Err(outcome) => return outcome,
            }
        }

        self.succeed(cmd, new_outputs, new_detritus)
    }

    fn immediate_skip(&self, cmd: CopyOutputsCommand, reason: BlacklistSkipReason) -> CacheCopyOutcome {
        CacheCopyOutcome::Failed(CopyingOutputsFailedResponse {
            key: cmd.key,
            attempt: self.attempt,
            failure: WorkflowError::BlacklistSkip(reason).to_string(),
        })
    }

    fn succeed(
        &self,
        cmd: CopyOutputsCommand,
        new_outputs: CallOutputs,
        new_detritus: BTreeMap<String, String>,
    ) -> CacheCopyOutcome {
        self.blacklist.mark_hit(cmd.cache_hit.id.clone(), BlacklistStatus::Good);
        let bucket = cmd
            .cache_hit
            .source_call_root
            .as_deref()
            .map(extract_blacklist_prefix);
        if let Some(bucket) = bucket {
            self.blacklist.mark_bucket(bucket, BlacklistStatus::Good);
        }
        CacheCopyOutcome::Succeeded(JobSucceededResponse {
            key: cmd.key,
            outputs: new_outputs,
            detritus: new_detritus,
            return_code: cmd.return_code,
            result_generation_mode: ResultGenerationMode::CallCached,
        })
    }

    /// Destination path computation + command set assembly (§4.8 steps 2-4).
    fn plan(
        &self,
        cmd: &CopyOutputsCommand,
        source_call_root: &str,
    ) -> crate::error::Result<(Vec<IoCommand>, CallOutputs, BTreeMap<String, String>)> {
        let mut commands = Vec::new();
        let mut new_outputs = CallOutputs::new();
        let mut new_detritus = BTreeMap::new();

        for simpleton in &cmd.simpletons {
            let relative = simpleton
                .source_path
                .strip_prefix(source_call_root)
                .unwrap_or(&simpleton.source_path);
            let destination = format!("{}{}", cmd.destination_call_root, relative);
            commands.push(IoCommand::Copy { src: simpleton.source_path.clone(), dst: destination.clone() });
            new_outputs.insert(simpleton.output_name.clone(), Value::File(destination));
        }

        for (detritus_key_name, source_path) in &cmd.cache_hit.source_detritus {
            if detritus_key_name == detritus_key::CALL_ROOT_PATH {
                continue;
            }
            let Some(destination) = cmd.job_detritus_files.get(detritus_key_name) else {
                continue;
            };
            commands.push(IoCommand::Copy { src: source_path.clone(), dst: destination.clone() });
            new_detritus.insert(detritus_key_name.clone(), destination.clone());
        }
        new_detritus.insert(detritus_key::CALL_ROOT_PATH.to_string(), cmd.destination_call_root.clone());

        Ok((commands, new_outputs, new_detritus))
    }

    /// Dispatch one command set concurrently and drive it to empty,
    /// updating the blacklist on any forbidden/failure response. Returns
    /// `Err` with the terminal outcome once `failAndAwaitPendingResponses`
    /// has run; `Ok(())` means every command in the set succeeded.
    async fn drain_set(
        &mut self,
        key: ExecutionKey,
        hit_id: CacheHitId,
        set: Vec<IoCommand>,
    ) -> Result<(), CacheCopyOutcome> {
        if set.is_empty() {
            return Ok(());
        }
        let responses: Vec<IoResponse> = join_all(set.into_iter().map(|c| self.io.send(c))).await;

        let mut failure: Option<CopyingOutputsFailedResponse> = None;
        for response in responses {
            match response {
                IoResponse::Success { .. } => {}
                IoResponse::ReadForbidden { command, path } => {
                    if failure.is_none() {
                        failure = Some(CopyingOutputsFailedResponse {
                            key: key.clone(),
                            attempt: self.attempt,
                            failure: WorkflowError::Expression(format!(
                                "read forbidden copying {:?}",
                                command
                            ))
                            .to_string(),
                        });
                    }
                    self.blacklist.mark_hit(hit_id.clone(), BlacklistStatus::Bad);
                    let bucket = extract_blacklist_prefix(&path);
                    self.blacklist.mark_bucket(bucket, BlacklistStatus::Bad);
                }
                IoResponse::Failure { command, error } => {
                    if let Some(source) = command.source() {
                        let bucket = extract_blacklist_prefix(source);
                        self.blacklist.mark_bucket(bucket, BlacklistStatus::Bad);
                    }
                    if failure.is_none() {
                        failure = Some(CopyingOutputsFailedResponse {
                            key: key.clone(),
                            attempt: self.attempt,
                            failure: WorkflowError::Backend(format!("{command:?}: {error}")).to_string(),
                        });
                    }
                }
            }
        }

        match failure {
            None => Ok(()),
            Some(f) => {
                self.state = FsmState::FailedState;
                Err(CacheCopyOutcome::Failed(f))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeIo {
        forbidden_path: Option<String>,
    }

    #[async_trait]
    impl IoClient for FakeIo {
        async fn send(&self, command: IoCommand) -> IoResponse {
            if let Some(p) = &self.forbidden_path {
                if command.source() == Some(p.as_str()) {
                    return IoResponse::ReadForbidden { command, path: p.clone() };
                }
            }
            IoResponse::Success { command }
        }
    }

    fn sample_cmd() -> CopyOutputsCommand {
        let mut source_detritus = BTreeMap::new();
        source_detritus.insert(detritus_key::CALL_ROOT_PATH.to_string(), "s3://bucket/src".to_string());
        CopyOutputsCommand {
            key: ExecutionKey::Call { scope: Scope::new("wf.A"), index: None },
            simpletons: vec![Simpleton {
                output_name: "out".into(),
                source_path: "s3://bucket/src/out.txt".into(),
            }],
            job_detritus_files: BTreeMap::new(),
            destination_call_root: "s3://bucket/dst".into(),
            cache_hit: CacheHit {
                id: CacheHitId("hit-1".into()),
                source_call_root: Some("s3://bucket/src".into()),
                source_detritus,
            },
            return_code: 0,
        }
    }

    #[tokio::test]
    async fn succeeds_and_marks_blacklist_good() {
        let io = FakeIo { forbidden_path: None };
        let blacklist = BlacklistCache::default();
        let hooks = NoopHooks;
        let fsm = CacheCopyFsm::new(&io, &blacklist, &hooks, 0);
        let outcome = fsm.run(sample_cmd(), || false).await;
        match outcome {
            CacheCopyOutcome::Succeeded(resp) => {
                assert_eq!(resp.outputs["out"], Value::File("s3://bucket/dst/out.txt".into()));
            }
            _ => panic!("expected success"),
        }
        assert_eq!(blacklist.hit_status(&CacheHitId("hit-1".into())), BlacklistStatus::Good);
    }

    #[tokio::test]
    async fn blacklisted_hit_skips_immediately() {
        let io = FakeIo { forbidden_path: None };
        let blacklist = BlacklistCache::default();
        blacklist.mark_hit(CacheHitId("hit-1".into()), BlacklistStatus::Bad);
        let hooks = NoopHooks;
        let fsm = CacheCopyFsm::new(&io, &blacklist, &hooks, 0);
        let outcome = fsm.run(sample_cmd(), || false).await;
        assert!(matches!(outcome, CacheCopyOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn forbidden_read_blacklists_bucket_and_fails() {
        let io = FakeIo { forbidden_path: Some("s3://bucket/src/out.txt".into()) };
        let blacklist = BlacklistCache::default();
        let hooks = NoopHooks;
        let fsm = CacheCopyFsm::new(&io, &blacklist, &hooks, 0);
        let outcome = fsm.run(sample_cmd(), || false).await;
        assert!(matches!(outcome, CacheCopyOutcome::Failed(_)));
        assert_eq!(blacklist.bucket_status(&BucketPrefix("s3://bucket".into())), BlacklistStatus::Bad);
    }

    #[tokio::test]
    async fn abort_before_dispatch_replies_aborted() {
        let io = FakeIo { forbidden_path: None };
        let blacklist = BlacklistCache::default();
        let hooks = NoopHooks;
        let fsm = CacheCopyFsm::new(&io, &blacklist, &hooks, 0);
        let outcome = fsm.run(sample_cmd(), || true).await;
        assert!(matches!(outcome, CacheCopyOutcome::Aborted(_)));
    }
}
