mod test_utils;

use futures::FutureExt;
use sandbox::{
    DataAccess, ResolverSnapshot, SandboxError, SandboxOptions, SandboxedConnection, TestSandbox,
};
use sea_orm::{ConnectionTrait, DatabaseConnection, EntityTrait, IsolationLevel};
use std::error::Error;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use test_utils::{
    TestError, TestResult, create_widget_table, insert_widget, sandboxed_database, stock_of, widget,
    widget_count,
};

#[tokio::test]
async fn test_writes_are_rolled_back_after_finish() -> TestResult {
    let connection = sandboxed_database().await?;
    let before = widget_count(connection.original()).await?;

    let sandbox = TestSandbox::new(&connection);
    sandbox.init().await?;

    let handle = connection.handle();
    insert_widget(&handle, "WID-100", 4).await?;
    assert_eq!(widget_count(&handle).await?, before + 1);

    sandbox.finish().await?;

    assert_eq!(widget_count(connection.original()).await?, before);
    assert_eq!(stock_of(connection.original(), "WID-100").await?, None);
    Ok(())
}

#[tokio::test]
async fn test_second_init_is_rejected() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);
    sandbox.init().await?;

    let error = sandbox.init().await.unwrap_err();
    assert!(matches!(error, SandboxError::AlreadyActive));
    assert_eq!(
        error.to_string(),
        "A transactional test context is already active for the provided database connection."
    );

    let other = TestSandbox::new(&connection);
    assert!(matches!(other.init().await, Err(SandboxError::AlreadyActive)));

    sandbox.finish().await?;
    sandbox.init().await?;
    sandbox.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_uninitialized_connection_is_rejected() {
    let connection = SandboxedConnection::new(DatabaseConnection::Disconnected);
    let error = TestSandbox::new(&connection).init().await.unwrap_err();
    assert!(matches!(error, SandboxError::NotInitialized));
    assert_eq!(
        error.to_string(),
        "Transactional tests require an initialized database connection."
    );
}

#[tokio::test]
async fn test_finish_without_init_is_a_no_op() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);

    sandbox.finish().await?;
    sandbox.after_each().await?;
    assert_eq!(connection.context().snapshot(), ResolverSnapshot::default());
    Ok(())
}

#[tokio::test]
async fn test_failed_rollback_still_unbinds_the_sandbox() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);
    sandbox.init().await?;
    let store = connection
        .active_store()
        .ok_or_else(|| TestError::assertion_failure("no active sandbox"))?;

    let handle = connection.handle();
    insert_widget(&handle, "WID-150", 1).await?;
    handle.execute_unprepared("ROLLBACK").await?;
    drop(handle);

    let error = sandbox.finish().await.unwrap_err();
    assert!(matches!(error, SandboxError::Database(_)), "{error}");

    assert!(!store.is_active());
    assert!(!store.is_transaction_open().await);
    assert!(connection.active_store().is_none());
    assert!(!connection.handle().is_sandboxed());
    assert_eq!(connection.context().snapshot(), ResolverSnapshot::default());

    sandbox.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_handle_is_substituted_only_while_active() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);

    assert!(!connection.handle().is_sandboxed());
    sandbox.before_each().await?;

    let handle = connection.handle();
    assert!(handle.is_sandboxed());
    let store = connection.active_store()
        .ok_or_else(|| TestError::assertion_failure("no active sandbox"))?;
    assert_eq!(handle.as_sandbox().map(|h| h.store().id()), Some(store.id()));

    sandbox.after_each().await?;
    assert!(!connection.handle().is_sandboxed());
    assert!(!store.is_active());
    assert!(!store.is_transaction_open().await);
    Ok(())
}

#[tokio::test]
async fn test_sandboxed_connection_routes_plain_sea_orm_calls() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);
    sandbox.init().await?;

    insert_widget(&connection, "WID-200", 9).await?;
    let all = widget::Entity::find().all(&connection).await?;
    assert!(all.iter().any(|widget| widget.sku == "WID-200"));

    sandbox.finish().await?;
    let all = widget::Entity::find().all(&connection).await?;
    assert!(all.iter().all(|widget| widget.sku != "WID-200"));
    Ok(())
}

#[tokio::test]
async fn test_replacement_default_handle_is_used_outside_sandbox() -> TestResult {
    let connection = sandboxed_database().await?;
    let replacement = Arc::new(common::test_helpers::connect_in_memory().await?);
    create_widget_table(replacement.as_ref()).await?;

    connection.set_default_handle(Arc::clone(&replacement));
    assert_eq!(widget_count(&connection.handle()).await?, 0);

    let sandbox = TestSandbox::new(&connection);
    sandbox.init().await?;
    assert_eq!(widget_count(&connection.handle()).await?, 2);
    sandbox.finish().await?;

    assert_eq!(widget_count(&connection.handle()).await?, 0);
    connection.reset_default_handle();
    assert_eq!(widget_count(&connection.handle()).await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_run_returns_body_value_and_rolls_back() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);

    let inserted = sandbox
        .run(|db: DataAccess| async move {
            let widget = insert_widget(&db, "WID-300", 1).await?;
            Ok::<_, Box<dyn Error + Send + Sync>>(widget)
        })
        .await?;

    assert_eq!(inserted.sku, "WID-300");
    assert_eq!(stock_of(connection.original(), "WID-300").await?, None);
    Ok(())
}

#[tokio::test]
async fn test_run_propagates_body_error_after_cleanup() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);

    let outcome: Result<(), Box<dyn Error + Send + Sync>> = sandbox
        .run(|db: DataAccess| async move {
            insert_widget(&db, "WID-301", 1).await?;
            insert_widget(&db, "WID-301", 1).await?;
            Ok(())
        })
        .await;

    assert!(outcome.is_err());
    assert!(connection.active_store().is_none());
    assert_eq!(stock_of(connection.original(), "WID-301").await?, None);
    Ok(())
}

#[tokio::test]
async fn test_run_finishes_sandbox_when_body_panics() -> TestResult {
    let connection = sandboxed_database().await?;
    let sandbox = TestSandbox::new(&connection);

    let outcome = AssertUnwindSafe(sandbox.run(|db: DataAccess| async move {
        insert_widget(&db, "WID-302", 1).await?;
        assert_eq!(widget_count(&db).await?, 0, "forced failure");
        Ok::<_, Box<dyn Error + Send + Sync>>(())
    }))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert!(connection.active_store().is_none());
    assert_eq!(connection.context().snapshot(), ResolverSnapshot::default());
    assert_eq!(stock_of(connection.original(), "WID-302").await?, None);

    sandbox.init().await?;
    sandbox.finish().await?;
    Ok(())
}

#[tokio::test]
async fn test_isolation_level_option_is_applied_on_begin() -> TestResult {
    let connection = sandboxed_database().await?;
    let options = SandboxOptions::default().with_isolation_level(IsolationLevel::Serializable);
    let sandbox = TestSandbox::with_options(&connection, options);

    sandbox.init().await?;
    assert_eq!(
        sandbox.options().isolation_level,
        Some(IsolationLevel::Serializable)
    );
    let store = connection.active_store()
        .ok_or_else(|| TestError::assertion_failure("no active sandbox"))?;
    assert!(!store.locking());
    sandbox.finish().await?;
    Ok(())
}

#[tokio::test]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn test_postgres_sandbox_runs_at_requested_isolation_level() -> TestResult {
    use sea_orm::{Database, Statement};

    let db = Database::connect(common::test_helpers::get_test_database_url()).await?;
    let connection = SandboxedConnection::new(db);
    let options = SandboxOptions::default().with_isolation_level(IsolationLevel::Serializable);
    let sandbox = TestSandbox::with_options(&connection, options);

    sandbox.init().await?;
    let handle = connection.handle();
    let row = handle
        .query_one(Statement::from_string(
            handle.get_database_backend(),
            "SHOW transaction_isolation",
        ))
        .await?
        .ok_or_else(|| TestError::assertion_failure("no row"))?;
    let level: String = row.try_get("", "transaction_isolation")?;
    assert_eq!(level, "serializable");
    assert!(connection.active_store().is_some_and(|store| store.locking()));
    sandbox.finish().await?;
    Ok(())
}
