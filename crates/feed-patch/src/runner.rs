use async_trait::async_trait;
use cdp_adapter::{Evaluation, Session};

/// Anything that can evaluate a script in a page context.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn evaluate(&self, script: &str, await_promise: bool, return_by_value: bool)
        -> Evaluation;
}

#[async_trait]
impl ScriptRunner for Session {
    async fn evaluate(
        &self,
        script: &str,
        await_promise: bool,
        return_by_value: bool,
    ) -> Evaluation {
        Session::evaluate(self, script, await_promise, return_by_value).await
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted runner: each evaluation records the script and pops the next
    /// answer queued for the first registered marker it contains.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        scripts: Mutex<Vec<String>>,
        answers: Mutex<Vec<(String, VecDeque<Evaluation>, Evaluation)>>,
    }

    impl FakeRunner {
        /// Answers scripts containing `marker` with `queued` in order, then
        /// with `fallback` forever.
        pub(crate) fn answer(&self, marker: &str, queued: Vec<Evaluation>, fallback: Evaluation) {
            self.answers
                .lock()
                .unwrap()
                .push((marker.to_string(), queued.into(), fallback));
        }

        pub(crate) fn count(&self, marker: &str) -> usize {
            self.scripts
                .lock()
                .unwrap()
                .iter()
                .filter(|script| script.contains(marker))
                .count()
        }

        pub(crate) fn scripts(&self) -> Vec<String> {
            self.scripts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ScriptRunner for FakeRunner {
        async fn evaluate(&self, script: &str, _await: bool, _by_value: bool) -> Evaluation {
            self.scripts.lock().unwrap().push(script.to_string());
            let mut answers = self.answers.lock().unwrap();
            for (marker, queued, fallback) in answers.iter_mut() {
                if script.contains(marker.as_str()) {
                    return queued.pop_front().unwrap_or_else(|| fallback.clone());
                }
            }
            Evaluation::Failed
        }
    }
}
