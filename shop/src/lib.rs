pub mod entities;
pub mod error;
pub mod inventory;
pub mod orders;
pub mod schema;
pub mod seeds;

pub use error::{ShopError, ShopResult};
pub use inventory::{InventoryService, RestockItem};
pub use orders::{OrderLine, OrderRequest, OrderService, PlacedOrder};
pub use schema::{create_schema, drop_schema};
pub use seeds::{SeedSummary, seed_database};
