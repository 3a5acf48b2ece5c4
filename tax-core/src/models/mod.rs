mod assignment;
mod context;
mod owner;
mod tax;
mod tax_group;
mod tax_rate;

pub use assignment::{AssignedEntity, ContextAssignment, GroupTaxLink};
pub use context::{ContextKey, TransactionContext, normalize_entity_type};
pub use owner::{Owned, Owner, OwnerError, OwnerRecord, SYSTEM_OWNER_TYPE};
pub use tax::{NewTax, Tax, TaxInput, TaxUpdate, slugify};
pub use tax_group::{NewTaxGroup, TaxGroup, TaxGroupInput, TaxGroupUpdate};
pub use tax_rate::{NewTaxRate, RateBasis, RateType, TaxRate, TaxRateUpdate};
