use crate::entities::{
    ORDER_CREATED, PAYMENT_PENDING, PAYMENT_SETTLED, order, order_item, payment, product, user,
};
use crate::error::{ShopError, ShopResult};
use chrono::Utc;
use sandbox::{Criteria, DataAccess, SandboxedConnection, TransactionRequest};
use sea_orm::ActiveModelTrait;
use sea_orm::ActiveValue::Set;
use tracing::{debug, info};
use uuid::Uuid;

pub const PAYMENT_REFERENCE_PREFIX: &str = "txn_service_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    pub sku: String,
    pub quantity: i32,
}

impl OrderLine {
    pub fn new(sku: impl Into<String>, quantity: i32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub user_email: String,
    pub provider: String,
    pub lines: Vec<OrderLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub payment: payment::Model,
}

#[derive(Debug, Clone)]
pub struct OrderService {
    connection: SandboxedConnection,
}

impl OrderService {
    pub fn new(connection: SandboxedConnection) -> Self {
        Self { connection }
    }

    /// Reserves inventory, records the order with its items and settles a
    /// payment for the total, all in one transaction.
    pub async fn place_order(&self, request: &OrderRequest) -> ShopResult<PlacedOrder> {
        let request = request.clone();
        let placed = self
            .connection
            .transaction(TransactionRequest::Simple(move |db: DataAccess| {
                let request = request.clone();
                async move { place_order_in(&db, &request).await }
            }))
            .await?;

        info!(
            "Placed order {} for {} cents",
            placed.order.id, placed.order.total_cents
        );
        Ok(placed)
    }
}

async fn place_order_in(db: &DataAccess, request: &OrderRequest) -> ShopResult<PlacedOrder> {
    let customer = db
        .find_one_by::<user::Entity>(Criteria::new().eq("email", request.user_email.as_str()))
        .await?
        .ok_or_else(|| ShopError::UserNotFound(request.user_email.clone()))?;

    let products = db.repository::<product::Entity>();
    let mut reserved = Vec::with_capacity(request.lines.len());
    let mut total_cents: i64 = 0;

    for line in &request.lines {
        if line.quantity <= 0 {
            return Err(ShopError::NonPositiveQuantity(line.sku.clone()));
        }

        let product = products
            .find_one_by(Criteria::new().eq("sku", line.sku.as_str()))
            .await?
            .ok_or_else(|| ShopError::ProductNotFound(line.sku.clone()))?;
        if product.inventory_count < line.quantity {
            return Err(ShopError::InsufficientInventory(line.sku.clone()));
        }

        total_cents += product.price_cents * i64::from(line.quantity);
        let inventory_count = product.inventory_count - line.quantity;
        let mut active: product::ActiveModel = product.into();
        active.inventory_count = Set(inventory_count);
        reserved.push((active.update(db).await?, line.quantity));
    }

    let now = Utc::now().naive_utc();
    let order = order::ActiveModel {
        user_id: Set(customer.id),
        status: Set(ORDER_CREATED.to_string()),
        total_cents: Set(total_cents),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;

    let mut items = Vec::with_capacity(reserved.len());
    for (product, quantity) in reserved {
        let item = order_item::ActiveModel {
            order_id: Set(order.id),
            product_id: Set(product.id),
            quantity: Set(quantity),
            unit_price_cents: Set(product.price_cents),
            ..Default::default()
        }
        .insert(db)
        .await?;
        items.push(item);
    }

    let pending = payment::ActiveModel {
        order_id: Set(order.id),
        provider: Set(request.provider.clone()),
        transaction_reference: Set(format!("{PAYMENT_REFERENCE_PREFIX}{}", Uuid::new_v4())),
        status: Set(PAYMENT_PENDING.to_string()),
        amount_cents: Set(total_cents),
        processed_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    debug!("Payment {} pending for order {}", pending.transaction_reference, order.id);

    let mut settled: payment::ActiveModel = pending.into();
    settled.status = Set(PAYMENT_SETTLED.to_string());
    settled.processed_at = Set(Utc::now().naive_utc());
    let payment = settled.update(db).await?;

    Ok(PlacedOrder {
        order,
        items,
        payment,
    })
}
