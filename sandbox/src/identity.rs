use std::fmt;
use std::future::Future;
use std::thread;

tokio::task_local! {
    static CURRENT_TEST: TestIdentity;
}

const IGNORED_THREAD_NAMES: [&str; 2] = ["main", "tokio-runtime-worker"];

/// Test file and/or test name. Either part may be missing; an identity with
/// neither part is treated as no identity at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TestIdentity {
    pub path: Option<String>,
    pub name: Option<String>,
}

impl TestIdentity {
    pub fn new(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            name: Some(name.into()),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            path: None,
            name: Some(name.into()),
        }
    }

    /// `path::name`, or whichever part is present.
    pub fn key(&self) -> Option<String> {
        let parts: Vec<&str> = [self.path.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("::"))
        }
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => f.write_str(&key),
            None => f.write_str("<anonymous>"),
        }
    }
}

/// Where the resolver asks "which test is running right now?".
///
/// Test harnesses that know better plug in their own source.
pub trait TestIdentitySource: Send + Sync {
    fn current_identity(&self) -> Option<TestIdentity>;
}

/// Identity bound by [`with_test_identity`] on the current task.
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskLocalIdentity;

impl TestIdentitySource for TaskLocalIdentity {
    fn current_identity(&self) -> Option<TestIdentity> {
        CURRENT_TEST.try_with(Clone::clone).ok()
    }
}

/// The libtest thread name, which is the test's module path.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadNameIdentity;

impl TestIdentitySource for ThreadNameIdentity {
    fn current_identity(&self) -> Option<TestIdentity> {
        let current = thread::current();
        let name = current.name()?;
        if IGNORED_THREAD_NAMES
            .iter()
            .any(|ignored| name.starts_with(ignored))
        {
            return None;
        }
        Some(TestIdentity::named(name))
    }
}

/// Task-local identity first, then the thread name.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIdentitySource;

impl TestIdentitySource for DefaultIdentitySource {
    fn current_identity(&self) -> Option<TestIdentity> {
        TaskLocalIdentity
            .current_identity()
            .or_else(|| ThreadNameIdentity.current_identity())
    }
}

/// Never reports an identity; resolution then relies on call-chain bindings
/// only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIdentity;

impl TestIdentitySource for NoIdentity {
    fn current_identity(&self) -> Option<TestIdentity> {
        None
    }
}

/// Run `future` as the test `identity`.
pub fn with_test_identity<F>(identity: TestIdentity, future: F) -> impl Future<Output = F::Output>
where
    F: Future,
{
    CURRENT_TEST.scope(identity, future)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_joins_present_parts() {
        assert_eq!(
            TestIdentity::new("tests/orders.rs", "places_order").key(),
            Some("tests/orders.rs::places_order".to_string())
        );
        assert_eq!(
            TestIdentity::named("places_order").key(),
            Some("places_order".to_string())
        );
        assert_eq!(TestIdentity::default().key(), None);
        assert_eq!(
            TestIdentity {
                path: Some(String::new()),
                name: Some("only_name".to_string()),
            }
            .key(),
            Some("only_name".to_string())
        );
    }

    #[tokio::test]
    async fn test_task_local_identity_wins_over_thread_name() {
        let identity = TestIdentity::new("suite", "case");
        let seen = with_test_identity(identity.clone(), async {
            DefaultIdentitySource.current_identity()
        })
        .await;
        assert_eq!(seen, Some(identity));
    }

    #[test]
    fn test_thread_name_identity_ignores_main_and_runtime_workers() {
        let named = thread::Builder::new()
            .name("orders::places_order".to_string())
            .spawn(|| ThreadNameIdentity.current_identity())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(named, Some(TestIdentity::named("orders::places_order")));

        let main = thread::Builder::new()
            .name("main".to_string())
            .spawn(|| ThreadNameIdentity.current_identity())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(main, None);

        let worker = thread::Builder::new()
            .name("tokio-runtime-worker".to_string())
            .spawn(|| ThreadNameIdentity.current_identity())
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(worker, None);
    }

    #[test]
    fn test_no_identity_source() {
        assert_eq!(NoIdentity.current_identity(), None);
    }
}
