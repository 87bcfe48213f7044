// テスト用のスクリプト化されたプロバイダー実装
// HTTPを使わずに成功・失敗の順序を再現する

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::error::ProviderError;
use crate::model::{CorrelationToken, ProviderResult, Summary};
use crate::providers::{AsyncProvider, ProviderArgs, ProviderInput, SyncProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Matches(u64),
    Graceful,
    Invalid,
    NotReady,
}

fn outcome(name: &'static str, step: Step) -> Result<ProviderResult, ProviderError> {
    match step {
        Step::Matches(count) => Ok(ProviderResult::ok(
            json!({ "provider": name, "matches": count }),
            Summary::Count(count),
        )),
        Step::Graceful => Err(ProviderError::graceful(name, "503 Service Unavailable")),
        Step::Invalid => Err(ProviderError::invalid_input(name, "unsupported image")),
        Step::NotReady => Err(ProviderError::NotReady { provider: name }),
    }
}

/// Plays `steps` in order, then repeats the last one forever.
struct Script {
    steps: Mutex<VecDeque<Step>>,
    last: Step,
    calls: AtomicU32,
}

impl Script {
    fn new(steps: Vec<Step>) -> Self {
        let last = steps.last().copied().unwrap_or(Step::Graceful);
        Self {
            steps: Mutex::new(steps.into()),
            last,
            calls: AtomicU32::new(0),
        }
    }

    fn next(&self) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.steps.lock().unwrap().pop_front().unwrap_or(self.last)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedSync {
    name: &'static str,
    script: Script,
}

impl ScriptedSync {
    pub(crate) fn new(name: &'static str, steps: Vec<Step>) -> Self {
        Self {
            name,
            script: Script::new(steps),
        }
    }

    pub(crate) fn always_ok(name: &'static str, matches: u64) -> Self {
        Self::new(name, vec![Step::Matches(matches)])
    }

    pub(crate) fn always_failing(name: &'static str) -> Self {
        Self::new(name, vec![Step::Graceful])
    }

    pub(crate) fn calls(&self) -> u32 {
        self.script.calls()
    }
}

#[async_trait]
impl SyncProvider for ScriptedSync {
    fn name(&self) -> &'static str {
        self.name
    }

    fn inputs(&self) -> &'static [ProviderInput] {
        &[ProviderInput::FileName, ProviderInput::Image, ProviderInput::ImageUrl]
    }

    async fn invoke(&self, args: &ProviderArgs) -> Result<ProviderResult, ProviderError> {
        args.image(self.name)?;
        outcome(self.name, self.script.next())
    }
}

pub(crate) struct ScriptedAsync {
    name: &'static str,
    submit: Script,
    resolve: Script,
}

impl ScriptedAsync {
    /// A `Matches` step on submit yields a token, anything else fails.
    pub(crate) fn new(name: &'static str, submit: Vec<Step>, resolve: Vec<Step>) -> Self {
        Self {
            name,
            submit: Script::new(submit),
            resolve: Script::new(resolve),
        }
    }

    pub(crate) fn ready(name: &'static str, matches: u64) -> Self {
        Self::new(name, vec![Step::Matches(0)], vec![Step::Matches(matches)])
    }

    pub(crate) fn never_ready(name: &'static str) -> Self {
        Self::new(name, vec![Step::Matches(0)], vec![Step::NotReady])
    }

    pub(crate) fn submits(&self) -> u32 {
        self.submit.calls()
    }

    pub(crate) fn resolves(&self) -> u32 {
        self.resolve.calls()
    }
}

#[async_trait]
impl AsyncProvider for ScriptedAsync {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn submit(&self, _image_url: &str) -> Result<CorrelationToken, ProviderError> {
        outcome(self.name, self.submit.next())
            .map(|_| CorrelationToken(format!("{}-token", self.name)))
    }

    async fn resolve(&self, token: &CorrelationToken) -> Result<ProviderResult, ProviderError> {
        assert_eq!(token.0, format!("{}-token", self.name));
        outcome(self.name, self.resolve.next())
    }
}
