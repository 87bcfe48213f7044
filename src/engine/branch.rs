//! Provider branches and the retry controller around them.
//!
//! A failed call is never waited out in place: the branch is re-enqueued
//! with its next attempt number and the configured delay. Once the policy
//! gives up, the last error becomes the branch's recorded result.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::VerificationEngine;
use super::join::Arrival;
use super::task::{BranchContext, BranchId, VerificationTask};
use crate::error::ProviderError;
use crate::model::{CorrelationToken, ProviderResult};
use crate::observability::metrics::{OUTCOME_ERROR, OUTCOME_OK, OUTCOME_RETRY};
use crate::providers::ProviderArgs;
use crate::store::FieldPatch;
use crate::util::retry::{RetryDecision, RetryPolicy};

impl VerificationEngine {
    pub(super) async fn run_provider_branch(
        &self,
        ctx: BranchContext,
        provider: BranchId,
        args: ProviderArgs,
        attempt: u32,
    ) {
        let Some(entry) = self.inner.providers.sync(provider) else {
            error!(provider, item_id = %ctx.item_id, "no adapter registered for branch");
            self.arrive(&ctx, provider);
            return;
        };
        info!(
            provider,
            item_id = %ctx.item_id,
            file_name = %ctx.file_name,
            attempt,
            max_retries = entry.policy.max_retries,
            "searching matches"
        );

        let started = Instant::now();
        let outcome = entry.adapter.invoke(&args).await;
        self.inner
            .metrics
            .provider_latency
            .with_label_values(&[provider])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                self.inner.metrics.record_provider_call(provider, OUTCOME_OK);
                info!(provider, item_id = %ctx.item_id, attempt, "matches found");
                self.settle(&ctx, provider, &result).await;
            }
            Err(err) => {
                let next = VerificationTask::ProviderBranch {
                    ctx: ctx.clone(),
                    provider,
                    args,
                    attempt,
                };
                self.retry_or_settle(&ctx, provider, &entry.policy, attempt, &err, next)
                    .await;
            }
        }
    }

    pub(super) async fn run_async_submit(
        &self,
        ctx: BranchContext,
        provider: BranchId,
        image_url: String,
        attempt: u32,
    ) {
        let Some(entry) = self.inner.providers.asynchronous() else {
            error!(provider, item_id = %ctx.item_id, "no asynchronous adapter registered");
            self.arrive(&ctx, provider);
            return;
        };
        info!(
            provider,
            item_id = %ctx.item_id,
            attempt,
            max_retries = entry.submit_policy.max_retries,
            "submitting image"
        );

        match entry.adapter.submit(&image_url).await {
            Ok(token) => {
                self.inner.metrics.record_provider_call(provider, OUTCOME_OK);
                let first_poll = entry.resolve_policy.backoff.delay_for_attempt(0);
                debug!(
                    provider,
                    item_id = %ctx.item_id,
                    token = %token,
                    first_poll_ms = u64::try_from(first_poll.as_millis()).unwrap_or(u64::MAX),
                    "submission accepted, scheduling resolve"
                );
                self.inner.sink.enqueue_after(
                    VerificationTask::AsyncResolve {
                        ctx,
                        provider,
                        token,
                        attempt: 0,
                    },
                    first_poll,
                );
            }
            Err(err) => {
                let next = VerificationTask::AsyncSubmit {
                    ctx: ctx.clone(),
                    provider,
                    image_url,
                    attempt,
                };
                self.retry_or_settle(&ctx, provider, &entry.submit_policy, attempt, &err, next)
                    .await;
            }
        }
    }

    pub(super) async fn run_async_resolve(
        &self,
        ctx: BranchContext,
        provider: BranchId,
        token: CorrelationToken,
        attempt: u32,
    ) {
        let Some(entry) = self.inner.providers.asynchronous() else {
            error!(provider, item_id = %ctx.item_id, "no asynchronous adapter registered");
            self.arrive(&ctx, provider);
            return;
        };
        self.inner.metrics.resolve_polls.inc();
        debug!(
            provider,
            item_id = %ctx.item_id,
            token = %token,
            attempt,
            max_retries = entry.resolve_policy.max_retries,
            "polling for results"
        );

        let started = Instant::now();
        let outcome = entry.adapter.resolve(&token).await;
        self.inner
            .metrics
            .provider_latency
            .with_label_values(&[provider])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(result) => {
                self.inner.metrics.record_provider_call(provider, OUTCOME_OK);
                info!(provider, item_id = %ctx.item_id, attempt, "asynchronous results resolved");
                self.settle(&ctx, provider, &result).await;
            }
            Err(err) => {
                let next = VerificationTask::AsyncResolve {
                    ctx: ctx.clone(),
                    provider,
                    token,
                    attempt,
                };
                self.retry_or_settle(&ctx, provider, &entry.resolve_policy, attempt, &err, next)
                    .await;
            }
        }
    }

    /// Reschedules `task` with its next attempt number, or records the error
    /// as the branch's terminal result.
    async fn retry_or_settle(
        &self,
        ctx: &BranchContext,
        provider: BranchId,
        policy: &RetryPolicy,
        attempt: u32,
        err: &ProviderError,
        task: VerificationTask,
    ) {
        match policy.decide(attempt, err) {
            RetryDecision::Retry {
                attempt: next_attempt,
                after,
            } => {
                self.inner
                    .metrics
                    .record_provider_call(provider, OUTCOME_RETRY);
                if matches!(err, ProviderError::NotReady { .. }) {
                    debug!(
                        provider,
                        item_id = %ctx.item_id,
                        attempt,
                        max_retries = policy.max_retries,
                        "results not ready yet, polling again"
                    );
                } else {
                    warn!(
                        provider,
                        item_id = %ctx.item_id,
                        file_name = %ctx.file_name,
                        attempt,
                        max_retries = policy.max_retries,
                        retry_in_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "provider call failed, retrying"
                    );
                }
                self.inner
                    .sink
                    .enqueue_after(with_attempt(task, next_attempt), after);
            }
            RetryDecision::GiveUp => {
                self.inner
                    .metrics
                    .record_provider_call(provider, OUTCOME_ERROR);
                error!(
                    provider,
                    item_id = %ctx.item_id,
                    file_name = %ctx.file_name,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "provider call failed permanently, recording error"
                );
                self.settle(ctx, provider, &ProviderResult::from_exhausted(err))
                    .await;
            }
        }
    }

    /// Persists a terminal result on both documents and reports to the join.
    async fn settle(&self, ctx: &BranchContext, provider: BranchId, result: &ProviderResult) {
        let item_patch =
            FieldPatch::new().set(&format!("verification.{provider}"), result.item_value());
        let record_patch = FieldPatch::new().set(provider, result.record_value());

        // Abandoned writes are already logged by the writer; the branch still
        // settles so the run can finish.
        self.inner
            .writer
            .patch_item(&ctx.item_id, &item_patch)
            .await;
        self.inner
            .writer
            .patch_record(ctx.verification_id, &record_patch)
            .await;

        self.arrive(ctx, provider);
    }

    pub(super) fn arrive(&self, ctx: &BranchContext, provider: BranchId) {
        match self.inner.joins.arrive(ctx.verification_id, provider) {
            Arrival::Released(finalize) => {
                debug!(
                    provider,
                    item_id = %ctx.item_id,
                    verification_id = %ctx.verification_id,
                    "last branch settled, releasing finalizer"
                );
                self.inner.sink.enqueue(VerificationTask::Finalize(finalize));
                self.refresh_open_joins();
            }
            Arrival::Pending { remaining } => {
                debug!(
                    provider,
                    item_id = %ctx.item_id,
                    remaining,
                    "branch settled, waiting for the others"
                );
            }
            Arrival::Duplicate | Arrival::Unknown => {
                warn!(
                    provider,
                    item_id = %ctx.item_id,
                    verification_id = %ctx.verification_id,
                    "ignoring arrival for a settled branch"
                );
            }
        }
    }
}

fn with_attempt(task: VerificationTask, next: u32) -> VerificationTask {
    match task {
        VerificationTask::ProviderBranch {
            ctx,
            provider,
            args,
            ..
        } => VerificationTask::ProviderBranch {
            ctx,
            provider,
            args,
            attempt: next,
        },
        VerificationTask::AsyncSubmit {
            ctx,
            provider,
            image_url,
            ..
        } => VerificationTask::AsyncSubmit {
            ctx,
            provider,
            image_url,
            attempt: next,
        },
        VerificationTask::AsyncResolve {
            ctx, provider, token, ..
        } => VerificationTask::AsyncResolve {
            ctx,
            provider,
            token,
            attempt: next,
        },
        VerificationTask::Finalize(task) => VerificationTask::Finalize(task),
    }
}
