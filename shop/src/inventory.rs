use crate::entities::product;
use crate::error::{ShopError, ShopResult};
use sandbox::{Criteria, DataAccess, SandboxedConnection, TransactionRequest};
use sea_orm::ActiveModelTrait;
use sea_orm::ActiveValue::Set;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestockItem {
    pub sku: String,
    pub quantity: i32,
}

impl RestockItem {
    pub fn new(sku: impl Into<String>, quantity: i32) -> Self {
        Self {
            sku: sku.into(),
            quantity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InventoryService {
    connection: SandboxedConnection,
}

impl InventoryService {
    pub fn new(connection: SandboxedConnection) -> Self {
        Self { connection }
    }

    /// Adds each item's quantity to its product's inventory in one
    /// transaction and returns the updated products in request order.
    ///
    /// Any unknown sku or non-positive quantity aborts the whole restock.
    pub async fn restock(&self, items: &[RestockItem]) -> ShopResult<Vec<product::Model>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let items = items.to_vec();
        let restocked = self
            .connection
            .transaction(TransactionRequest::Simple(move |db: DataAccess| {
                let items = items.clone();
                async move { restock_in(&db, &items).await }
            }))
            .await?;

        info!("Restocked {} products", restocked.len());
        Ok(restocked)
    }
}

async fn restock_in(db: &DataAccess, items: &[RestockItem]) -> ShopResult<Vec<product::Model>> {
    let products = db.repository::<product::Entity>();
    let mut updated = Vec::with_capacity(items.len());

    for item in items {
        if item.quantity <= 0 {
            return Err(ShopError::NonPositiveQuantity(item.sku.clone()));
        }

        let product = products
            .find_one_by(Criteria::new().eq("sku", item.sku.as_str()))
            .await?
            .ok_or_else(|| ShopError::ProductNotFound(item.sku.clone()))?;

        let inventory_count = product.inventory_count + item.quantity;
        let mut active: product::ActiveModel = product.into();
        active.inventory_count = Set(inventory_count);
        updated.push(active.update(db).await?);
    }

    Ok(updated)
}
