use crate::connection::DataAccess;
use crate::store::{ScopedHandle, TransactionStore};
use async_trait::async_trait;
use sea_orm::sea_query::{Expr, SimpleExpr};
use sea_orm::{
    ColumnTrait, DbBackend, DbErr, EntityTrait, Order, QueryFilter, QueryOrder, QuerySelect,
    QueryTrait, Select, Statement, Value,
};
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engines that understand `FOR UPDATE` row locks.
pub fn supports_row_locks(backend: DbBackend) -> bool {
    matches!(backend, DbBackend::Postgres | DbBackend::MySql)
}

#[derive(Debug, Clone)]
pub enum Criterion {
    Equals(Value),
    NotEquals(Value),
    In(Vec<Value>),
    Like(String),
    GreaterThan(Value),
    LessThan(Value),
    IsNull,
    IsNotNull,
}

/// Property-to-criterion filter, properties named as the entity's columns.
#[derive(Debug, Clone, Default)]
pub struct Criteria {
    entries: Vec<(String, Criterion)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, property: impl Into<String>, criterion: Criterion) -> Self {
        self.entries.push((property.into(), criterion));
        self
    }

    pub fn eq(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Criterion::Equals(value.into()))
    }

    pub fn ne(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Criterion::NotEquals(value.into()))
    }

    pub fn is_in<I, V>(self, property: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.with(property, Criterion::In(values))
    }

    pub fn like(self, property: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.with(property, Criterion::Like(pattern.into()))
    }

    pub fn gt(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Criterion::GreaterThan(value.into()))
    }

    pub fn lt(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(property, Criterion::LessThan(value.into()))
    }

    pub fn is_null(self, property: impl Into<String>) -> Self {
        self.with(property, Criterion::IsNull)
    }

    pub fn is_not_null(self, property: impl Into<String>) -> Self {
        self.with(property, Criterion::IsNotNull)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[(String, Criterion)] {
        &self.entries
    }

    /// Equality keys usable for a row lock, or `None` when any criterion is
    /// not a plain equality on a scalar.
    pub fn lock_keys(&self) -> Option<Vec<(String, Value)>> {
        if self.entries.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .map(|(property, criterion)| match criterion {
                Criterion::Equals(value) if is_scalar(value) => {
                    Some((property.clone(), value.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

fn is_scalar(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(_)
            | Value::TinyInt(_)
            | Value::SmallInt(_)
            | Value::Int(_)
            | Value::BigInt(_)
            | Value::TinyUnsigned(_)
            | Value::SmallUnsigned(_)
            | Value::Unsigned(_)
            | Value::BigUnsigned(_)
            | Value::Float(_)
            | Value::Double(_)
            | Value::String(_)
            | Value::Char(_)
    )
}

fn is_null(value: &Value) -> bool {
    matches!(
        value,
        Value::Bool(None)
            | Value::TinyInt(None)
            | Value::SmallInt(None)
            | Value::Int(None)
            | Value::BigInt(None)
            | Value::TinyUnsigned(None)
            | Value::SmallUnsigned(None)
            | Value::Unsigned(None)
            | Value::BigUnsigned(None)
            | Value::Float(None)
            | Value::Double(None)
            | Value::String(None)
            | Value::Char(None)
    )
}

#[derive(Debug, Clone, Default)]
pub struct FindOneOptions {
    pub filter: Option<Criteria>,
    pub order_by: Vec<(String, Order)>,
}

impl FindOneOptions {
    pub fn filter(criteria: Criteria) -> Self {
        Self {
            filter: Some(criteria),
            order_by: Vec::new(),
        }
    }

    pub fn order_by(mut self, property: impl Into<String>, order: Order) -> Self {
        self.order_by.push((property.into(), order));
        self
    }
}

impl From<Criteria> for FindOneOptions {
    fn from(criteria: Criteria) -> Self {
        Self::filter(criteria)
    }
}

/// Single-row lookup capability shared by plain and locking repositories.
#[async_trait]
pub trait FindOne<E>: Send + Sync
where
    E: EntityTrait,
{
    async fn find_one(&self, options: FindOneOptions) -> Result<Option<E::Model>, DbErr>;

    async fn find_one_or_fail(&self, options: FindOneOptions) -> Result<E::Model, DbErr>;

    async fn find_one_by(&self, criteria: Criteria) -> Result<Option<E::Model>, DbErr>;

    async fn find_one_by_or_fail(&self, criteria: Criteria) -> Result<E::Model, DbErr>;
}

fn table_name<E: EntityTrait>() -> String {
    E::default().table_name().to_string()
}

fn resolve_column<E: EntityTrait>(property: &str) -> Option<E::Column> {
    E::Column::from_str(property).ok()
}

fn unknown_property<E: EntityTrait>(property: &str) -> DbErr {
    DbErr::Custom(format!(
        "Unknown property \"{property}\" on entity \"{}\"",
        table_name::<E>()
    ))
}

fn not_found<E: EntityTrait>() -> DbErr {
    DbErr::RecordNotFound(format!(
        "Could not find any entity of type \"{}\" matching the criteria",
        table_name::<E>()
    ))
}

fn condition<C: ColumnTrait>(column: C, criterion: &Criterion) -> SimpleExpr {
    match criterion {
        Criterion::Equals(value) if is_null(value) => column.is_null(),
        Criterion::Equals(value) => column.eq(value.clone()),
        Criterion::NotEquals(value) if is_null(value) => column.is_not_null(),
        Criterion::NotEquals(value) => column.ne(value.clone()),
        Criterion::In(values) => column.is_in(values.clone()),
        Criterion::Like(pattern) => column.like(pattern.clone()),
        Criterion::GreaterThan(value) => column.gt(value.clone()),
        Criterion::LessThan(value) => column.lt(value.clone()),
        Criterion::IsNull => column.is_null(),
        Criterion::IsNotNull => column.is_not_null(),
    }
}

/// `SELECT 1 FROM <table> WHERE <key> = ? [AND ...] LIMIT 1 FOR UPDATE`, or
/// `None` when a key does not name a column of `E`.
pub fn lock_statement<E>(backend: DbBackend, keys: &[(String, Value)]) -> Option<Statement>
where
    E: EntityTrait,
{
    if keys.is_empty() {
        return None;
    }

    let mut select = E::find().select_only().expr(Expr::cust("1"));
    for (property, value) in keys {
        let column = resolve_column::<E>(property)?;
        select = select.filter(condition(column, &Criterion::Equals(value.clone())));
    }

    Some(select.limit(1u64).lock_exclusive().build(backend))
}

/// Plain lookups through whatever handle it was created with.
pub struct Repository<E> {
    handle: DataAccess,
    entity: PhantomData<fn() -> E>,
}

impl<E> Repository<E>
where
    E: EntityTrait,
{
    pub fn new(handle: DataAccess) -> Self {
        Self {
            handle,
            entity: PhantomData,
        }
    }

    pub fn handle(&self) -> &DataAccess {
        &self.handle
    }

    fn select(criteria: Option<&Criteria>, order_by: &[(String, Order)]) -> Result<Select<E>, DbErr> {
        let mut select = E::find();
        for (property, criterion) in criteria.map(Criteria::entries).unwrap_or_default() {
            let column = resolve_column::<E>(property).ok_or_else(|| unknown_property::<E>(property))?;
            select = select.filter(condition(column, criterion));
        }
        for (property, order) in order_by {
            let column = resolve_column::<E>(property).ok_or_else(|| unknown_property::<E>(property))?;
            select = select.order_by(column, order.clone());
        }
        Ok(select)
    }
}

#[async_trait]
impl<E> FindOne<E> for Repository<E>
where
    E: EntityTrait,
{
    async fn find_one(&self, options: FindOneOptions) -> Result<Option<E::Model>, DbErr> {
        Self::select(options.filter.as_ref(), &options.order_by)?
            .one(&self.handle)
            .await
    }

    async fn find_one_or_fail(&self, options: FindOneOptions) -> Result<E::Model, DbErr> {
        self.find_one(options).await?.ok_or_else(not_found::<E>)
    }

    async fn find_one_by(&self, criteria: Criteria) -> Result<Option<E::Model>, DbErr> {
        self.find_one(FindOneOptions::filter(criteria)).await
    }

    async fn find_one_by_or_fail(&self, criteria: Criteria) -> Result<E::Model, DbErr> {
        self.find_one_or_fail(FindOneOptions::filter(criteria)).await
    }
}

/// Repository bound to a sandbox that locks the target row before reading it
/// when the sandbox has locking enabled, so two tests doing read-then-write on
/// the same row queue up.
pub struct LockingRepository<E> {
    inner: Repository<E>,
    store: Arc<TransactionStore>,
}

impl<E> LockingRepository<E>
where
    E: EntityTrait,
{
    pub(crate) fn new(handle: ScopedHandle) -> Self {
        Self {
            store: Arc::clone(handle.store()),
            inner: Repository::new(DataAccess::Sandbox(handle)),
        }
    }

    pub fn inner(&self) -> &Repository<E> {
        &self.inner
    }

    async fn acquire_lock(&self, criteria: Option<&Criteria>) {
        if !self.store.locking() {
            return;
        }
        let Some(keys) = criteria.and_then(Criteria::lock_keys) else {
            return;
        };
        let Some(statement) = lock_statement::<E>(self.store.backend(), &keys) else {
            debug!(table = %table_name::<E>(), "lookup keys do not map to columns; skipping row lock");
            return;
        };

        debug!(store = self.store.id(), sql = %statement.sql, "acquiring row lock");
        if let Err(error) = self.store.query_one(statement).await {
            warn!(
                store = self.store.id(),
                table = %table_name::<E>(),
                %error,
                "failed to acquire row lock; continuing without it"
            );
        }
    }
}

#[async_trait]
impl<E> FindOne<E> for LockingRepository<E>
where
    E: EntityTrait,
{
    async fn find_one(&self, options: FindOneOptions) -> Result<Option<E::Model>, DbErr> {
        self.acquire_lock(options.filter.as_ref()).await;
        self.inner.find_one(options).await
    }

    async fn find_one_or_fail(&self, options: FindOneOptions) -> Result<E::Model, DbErr> {
        self.acquire_lock(options.filter.as_ref()).await;
        self.inner.find_one_or_fail(options).await
    }

    async fn find_one_by(&self, criteria: Criteria) -> Result<Option<E::Model>, DbErr> {
        self.acquire_lock(Some(&criteria)).await;
        self.inner.find_one_by(criteria).await
    }

    async fn find_one_by_or_fail(&self, criteria: Criteria) -> Result<E::Model, DbErr> {
        self.acquire_lock(Some(&criteria)).await;
        self.inner.find_one_by_or_fail(criteria).await
    }
}
