use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite};
use tax_core::db::repository::{
    RepositoryError, TaxAssignmentStore, TaxGroupStore, TaxRateStore, TaxStore,
};
use tax_core::models::{
    AssignedEntity, ContextAssignment, ContextKey, GroupTaxLink, NewTax, NewTaxGroup, NewTaxRate,
    Owner, RateBasis, RateType, Tax, TaxGroup, TaxGroupUpdate, TaxRate, TaxRateUpdate, TaxUpdate,
};

use crate::decimal::{decimal_to_text, get_decimal, get_optional_decimal};

const TAX_COLUMNS: &str =
    "id, owner_type, owner_id, name, slug, description, is_active, version, created_at, updated_at";

const GROUP_COLUMNS: &str =
    "id, owner_type, owner_id, name, description, is_active, version, created_at, updated_at";

const RATE_COLUMNS: &str = "id, tax_group_id, tax_id, rate, rate_type, is_inclusive, priority,
     based_on, valid_from, valid_until, min_price, max_price, version, created_at, updated_at";

const ASSIGNMENT_COLUMNS: &str = "id, tax_group_id, entity_type, entity_id, created_at";

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Opens the database at `database_url`, which may be a bare file path
    /// (created if missing), a `sqlite:` URL or `:memory:`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database url: {}", database_url))?
            .create_if_missing(true)
            .foreign_keys(true);

        // Every connection to an in-memory database would otherwise see its
        // own empty database.
        let pool_options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to connect to database: {}", database_url))?;
        Ok(Self { pool })
    }

    pub async fn new_with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn db_error(e: sqlx::Error) -> RepositoryError {
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation() {
            return RepositoryError::Conflict(db.message().to_string());
        }
    }
    RepositoryError::Database(e.to_string())
}

fn column<'r, T>(
    row: &'r SqliteRow,
    name: &str,
) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name)
        .map_err(|e| RepositoryError::Database(format!("Failed to get {}: {}", name, e)))
}

fn check_version(
    stored: i64,
    expected: i64,
) -> Result<(), RepositoryError> {
    if stored != expected {
        return Err(RepositoryError::Conflict(format!(
            "stale version {}, current version is {}",
            expected, stored
        )));
    }
    Ok(())
}

fn row_to_owner(row: &SqliteRow) -> Result<Owner, RepositoryError> {
    let owner_type: String = column(row, "owner_type")?;
    let owner_id: Option<String> = column(row, "owner_id")?;
    Owner::parse(&owner_type, owner_id.as_deref())
        .map_err(|e| RepositoryError::Database(format!("Invalid owner: {}", e)))
}

fn row_to_tax(row: &SqliteRow) -> Result<Tax, RepositoryError> {
    Ok(Tax {
        id: column(row, "id")?,
        owner: row_to_owner(row)?,
        name: column(row, "name")?,
        slug: column(row, "slug")?,
        description: column(row, "description")?,
        is_active: column(row, "is_active")?,
        version: column(row, "version")?,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        updated_at: column::<DateTime<Utc>>(row, "updated_at")?,
    })
}

fn row_to_group(row: &SqliteRow) -> Result<TaxGroup, RepositoryError> {
    Ok(TaxGroup {
        id: column(row, "id")?,
        owner: row_to_owner(row)?,
        name: column(row, "name")?,
        description: column(row, "description")?,
        is_active: column(row, "is_active")?,
        version: column(row, "version")?,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        updated_at: column::<DateTime<Utc>>(row, "updated_at")?,
    })
}

fn row_to_rate(row: &SqliteRow) -> Result<TaxRate, RepositoryError> {
    let rate_type: String = column(row, "rate_type")?;
    let based_on: String = column(row, "based_on")?;

    Ok(TaxRate {
        id: column(row, "id")?,
        tax_group_id: column(row, "tax_group_id")?,
        tax_id: column(row, "tax_id")?,
        rate: get_decimal(row, "rate")?,
        rate_type: RateType::parse(&rate_type).ok_or_else(|| {
            RepositoryError::Database(format!("Invalid rate type: {}", rate_type))
        })?,
        is_inclusive: column(row, "is_inclusive")?,
        priority: column(row, "priority")?,
        based_on: RateBasis::parse(&based_on).ok_or_else(|| {
            RepositoryError::Database(format!("Invalid rate basis: {}", based_on))
        })?,
        valid_from: column::<Option<DateTime<Utc>>>(row, "valid_from")?,
        valid_until: column::<Option<DateTime<Utc>>>(row, "valid_until")?,
        min_price: get_optional_decimal(row, "min_price")?,
        max_price: get_optional_decimal(row, "max_price")?,
        version: column(row, "version")?,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
        updated_at: column::<DateTime<Utc>>(row, "updated_at")?,
    })
}

fn row_to_assignment(row: &SqliteRow) -> Result<ContextAssignment, RepositoryError> {
    Ok(ContextAssignment {
        id: column(row, "id")?,
        tax_group_id: column(row, "tax_group_id")?,
        key: ContextKey {
            entity_type: column(row, "entity_type")?,
            entity_id: column(row, "entity_id")?,
        },
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
    })
}

fn row_to_link(row: &SqliteRow) -> Result<GroupTaxLink, RepositoryError> {
    Ok(GroupTaxLink {
        tax_group_id: column(row, "tax_group_id")?,
        tax_id: column(row, "tax_id")?,
        created_at: column::<DateTime<Utc>>(row, "created_at")?,
    })
}

async fn exists(
    conn: &mut SqliteConnection,
    table: &str,
    id: i64,
) -> Result<bool, RepositoryError> {
    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {} WHERE id = ?", table))
        .bind(id)
        .fetch_one(&mut *conn)
        .await
        .map_err(db_error)?;
    Ok(count > 0)
}

async fn fetch_tax(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Tax>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {} FROM taxes WHERE id = ?", TAX_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    row.as_ref().map(row_to_tax).transpose()
}

async fn insert_tax(
    conn: &mut SqliteConnection,
    tax: &NewTax,
    now: DateTime<Utc>,
) -> Result<Tax, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO taxes (
            owner_type, owner_id, name, slug, description, is_active, version,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(tax.owner.owner_type())
    .bind(tax.owner.owner_id())
    .bind(&tax.name)
    .bind(&tax.slug)
    .bind(tax.description.as_deref())
    .bind(tax.is_active)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| match db_error(e) {
        RepositoryError::Conflict(_) => RepositoryError::Conflict(format!(
            "slug '{}' already exists for owner {}",
            tax.slug, tax.owner
        )),
        other => other,
    })?;

    fetch_tax(conn, result.last_insert_rowid())
        .await?
        .ok_or(RepositoryError::NotFound)
}

async fn fetch_group(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<TaxGroup>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {} FROM tax_groups WHERE id = ?", GROUP_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    row.as_ref().map(row_to_group).transpose()
}

async fn insert_group(
    conn: &mut SqliteConnection,
    group: &NewTaxGroup,
    now: DateTime<Utc>,
) -> Result<TaxGroup, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO tax_groups (
            owner_type, owner_id, name, description, is_active, version,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(group.owner.owner_type())
    .bind(group.owner.owner_id())
    .bind(&group.name)
    .bind(group.description.as_deref())
    .bind(group.is_active)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(db_error)?;

    fetch_group(conn, result.last_insert_rowid())
        .await?
        .ok_or(RepositoryError::NotFound)
}

async fn fetch_rate(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<TaxRate>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {} FROM tax_rates WHERE id = ?", RATE_COLUMNS))
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error)?;
    row.as_ref().map(row_to_rate).transpose()
}

#[async_trait]
impl TaxStore for SqliteRepository {
    async fn create_tax(
        &self,
        tax: NewTax,
    ) -> Result<Tax, RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        insert_tax(&mut conn, &tax, Utc::now()).await
    }

    async fn create_taxes(
        &self,
        taxes: Vec<NewTax>,
    ) -> Result<Vec<Tax>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let now = Utc::now();

        let mut created = Vec::with_capacity(taxes.len());
        for tax in &taxes {
            created.push(insert_tax(&mut tx, tax, now).await?);
        }

        tx.commit().await.map_err(db_error)?;
        Ok(created)
    }

    async fn update_tax(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxUpdate,
    ) -> Result<Tax, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut tax = fetch_tax(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        check_version(tax.version, expected_version)?;
        changes.apply_to(&mut tax);

        let result = sqlx::query(
            "UPDATE taxes SET
                name = ?, slug = ?, description = ?, is_active = ?,
                version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&tax.name)
        .bind(&tax.slug)
        .bind(tax.description.as_deref())
        .bind(tax.is_active)
        .bind(Utc::now())
        .bind(id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "tax {} was modified concurrently",
                id
            )));
        }

        let updated = fetch_tax(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        tx.commit().await.map_err(db_error)?;
        Ok(updated)
    }

    async fn delete_tax(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let tax = fetch_tax(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        check_version(tax.version, expected_version)?;

        let rates: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tax_rates WHERE tax_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;
        if rates > 0 {
            return Err(RepositoryError::Conflict(format!(
                "tax {} is still referenced by rates",
                id
            )));
        }

        sqlx::query("DELETE FROM group_tax_links WHERE tax_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        sqlx::query("DELETE FROM taxes WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn find_tax(
        &self,
        id: i64,
    ) -> Result<Option<Tax>, RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_tax(&mut conn, id).await
    }

    async fn find_taxes_by_owner(
        &self,
        owner: &Owner,
    ) -> Result<Vec<Tax>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM taxes WHERE owner_type = ? AND owner_id IS ? ORDER BY id",
            TAX_COLUMNS
        ))
        .bind(owner.owner_type())
        .bind(owner.owner_id())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_tax).collect()
    }
}

#[async_trait]
impl TaxGroupStore for SqliteRepository {
    async fn create_group(
        &self,
        group: NewTaxGroup,
    ) -> Result<TaxGroup, RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        insert_group(&mut conn, &group, Utc::now()).await
    }

    async fn create_groups(
        &self,
        groups: Vec<NewTaxGroup>,
    ) -> Result<Vec<TaxGroup>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let now = Utc::now();

        let mut created = Vec::with_capacity(groups.len());
        for group in &groups {
            created.push(insert_group(&mut tx, group, now).await?);
        }

        tx.commit().await.map_err(db_error)?;
        Ok(created)
    }

    async fn update_group(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxGroupUpdate,
    ) -> Result<TaxGroup, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut group = fetch_group(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        check_version(group.version, expected_version)?;
        changes.apply_to(&mut group);

        let result = sqlx::query(
            "UPDATE tax_groups SET
                name = ?, description = ?, is_active = ?,
                version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&group.name)
        .bind(group.description.as_deref())
        .bind(group.is_active)
        .bind(Utc::now())
        .bind(id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "tax group {} was modified concurrently",
                id
            )));
        }

        let updated = fetch_group(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        tx.commit().await.map_err(db_error)?;
        Ok(updated)
    }

    async fn delete_group(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let group = fetch_group(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        check_version(group.version, expected_version)?;

        for statement in [
            "DELETE FROM tax_rates WHERE tax_group_id = ?",
            "DELETE FROM context_assignments WHERE tax_group_id = ?",
            "DELETE FROM group_tax_links WHERE tax_group_id = ?",
            "DELETE FROM tax_groups WHERE id = ?",
        ] {
            sqlx::query(statement)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn find_group(
        &self,
        id: i64,
    ) -> Result<Option<TaxGroup>, RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_group(&mut conn, id).await
    }

    async fn find_groups_by_owner(
        &self,
        owner: &Owner,
    ) -> Result<Vec<TaxGroup>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tax_groups WHERE owner_type = ? AND owner_id IS ? ORDER BY id",
            GROUP_COLUMNS
        ))
        .bind(owner.owner_type())
        .bind(owner.owner_id())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_group).collect()
    }

    async fn find_groups_by_assigned_entity(
        &self,
        entity: &AssignedEntity,
    ) -> Result<Vec<TaxGroup>, RepositoryError> {
        let rows = match entity {
            AssignedEntity::Tax { tax_id } => {
                sqlx::query(&format!(
                    "SELECT {} FROM tax_groups
                     WHERE id IN (SELECT tax_group_id FROM group_tax_links WHERE tax_id = ?)
                     ORDER BY id",
                    GROUP_COLUMNS
                ))
                .bind(*tax_id)
                .fetch_all(&self.pool)
                .await
            }
            AssignedEntity::Context(key) => {
                sqlx::query(&format!(
                    "SELECT {} FROM tax_groups
                     WHERE id IN (
                         SELECT tax_group_id FROM context_assignments
                         WHERE entity_type = ? AND entity_id = ?
                     )
                     ORDER BY id",
                    GROUP_COLUMNS
                ))
                .bind(&key.entity_type)
                .bind(&key.entity_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(db_error)?;

        rows.iter().map(row_to_group).collect()
    }
}

#[async_trait]
impl TaxRateStore for SqliteRepository {
    async fn create_rate(
        &self,
        rate: NewTaxRate,
    ) -> Result<TaxRate, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        if !exists(&mut tx, "tax_groups", rate.tax_group_id).await? {
            return Err(RepositoryError::Conflict(format!(
                "tax group {} does not exist",
                rate.tax_group_id
            )));
        }
        if !exists(&mut tx, "taxes", rate.tax_id).await? {
            return Err(RepositoryError::Conflict(format!(
                "tax {} does not exist",
                rate.tax_id
            )));
        }

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO tax_rates (
                tax_group_id, tax_id, rate, rate_type, is_inclusive, priority, based_on,
                valid_from, valid_until, min_price, max_price, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(rate.tax_group_id)
        .bind(rate.tax_id)
        .bind(decimal_to_text(rate.rate))
        .bind(rate.rate_type.as_str())
        .bind(rate.is_inclusive)
        .bind(rate.priority)
        .bind(rate.based_on.as_str())
        .bind(rate.valid_from)
        .bind(rate.valid_until)
        .bind(rate.min_price.map(decimal_to_text))
        .bind(rate.max_price.map(decimal_to_text))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let created = fetch_rate(&mut tx, result.last_insert_rowid())
            .await?
            .ok_or(RepositoryError::NotFound)?;
        tx.commit().await.map_err(db_error)?;
        Ok(created)
    }

    async fn update_rate(
        &self,
        id: i64,
        expected_version: i64,
        changes: &TaxRateUpdate,
    ) -> Result<TaxRate, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let mut rate = fetch_rate(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        check_version(rate.version, expected_version)?;
        if let Some(tax_id) = changes.tax_id {
            if !exists(&mut tx, "taxes", tax_id).await? {
                return Err(RepositoryError::Conflict(format!(
                    "tax {} does not exist",
                    tax_id
                )));
            }
        }
        changes.apply_to(&mut rate);

        let result = sqlx::query(
            "UPDATE tax_rates SET
                tax_id = ?, rate = ?, rate_type = ?, is_inclusive = ?, priority = ?,
                based_on = ?, valid_from = ?, valid_until = ?, min_price = ?, max_price = ?,
                version = version + 1, updated_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(rate.tax_id)
        .bind(decimal_to_text(rate.rate))
        .bind(rate.rate_type.as_str())
        .bind(rate.is_inclusive)
        .bind(rate.priority)
        .bind(rate.based_on.as_str())
        .bind(rate.valid_from)
        .bind(rate.valid_until)
        .bind(rate.min_price.map(decimal_to_text))
        .bind(rate.max_price.map(decimal_to_text))
        .bind(Utc::now())
        .bind(id)
        .bind(expected_version)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict(format!(
                "tax rate {} was modified concurrently",
                id
            )));
        }

        let updated = fetch_rate(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        tx.commit().await.map_err(db_error)?;
        Ok(updated)
    }

    async fn delete_rate(
        &self,
        id: i64,
        expected_version: i64,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let rate = fetch_rate(&mut tx, id)
            .await?
            .ok_or(RepositoryError::NotFound)?;
        check_version(rate.version, expected_version)?;

        sqlx::query("DELETE FROM tax_rates WHERE id = ? AND version = ?")
            .bind(id)
            .bind(expected_version)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;

        Ok(())
    }

    async fn find_rate(
        &self,
        id: i64,
    ) -> Result<Option<TaxRate>, RepositoryError> {
        let mut conn = self.pool.acquire().await.map_err(db_error)?;
        fetch_rate(&mut conn, id).await
    }

    async fn find_rates_by_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<TaxRate>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tax_rates WHERE tax_group_id = ? ORDER BY priority, id",
            RATE_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_rate).collect()
    }

    /// The validity window is checked on decoded timestamps rather than in
    /// SQL, where RFC 3339 strings with differing precision do not compare
    /// correctly.
    async fn find_active_rates_by_group(
        &self,
        group_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<TaxRate>, RepositoryError> {
        let mut rates = self.find_rates_by_group(group_id).await?;
        rates.retain(|rate| rate.is_valid_at(as_of));
        Ok(rates)
    }
}

#[async_trait]
impl TaxAssignmentStore for SqliteRepository {
    async fn create_assignments(
        &self,
        group_id: i64,
        keys: &[ContextKey],
    ) -> Result<Vec<ContextAssignment>, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        if !exists(&mut tx, "tax_groups", group_id).await? {
            return Err(RepositoryError::NotFound);
        }

        let now = Utc::now();
        let mut created = Vec::new();
        for key in keys {
            let result = sqlx::query(
                "INSERT INTO context_assignments (tax_group_id, entity_type, entity_id, created_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT (tax_group_id, entity_type, entity_id) DO NOTHING",
            )
            .bind(group_id)
            .bind(&key.entity_type)
            .bind(&key.entity_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

            if result.rows_affected() > 0 {
                created.push(ContextAssignment {
                    id: result.last_insert_rowid(),
                    tax_group_id: group_id,
                    key: key.clone(),
                    created_at: now,
                });
            }
        }

        tx.commit().await.map_err(db_error)?;
        Ok(created)
    }

    async fn delete_assignments(
        &self,
        group_id: i64,
        keys: &[ContextKey],
    ) -> Result<u64, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let mut removed = 0;
        for key in keys {
            let result = sqlx::query(
                "DELETE FROM context_assignments
                 WHERE tax_group_id = ? AND entity_type = ? AND entity_id = ?",
            )
            .bind(group_id)
            .bind(&key.entity_type)
            .bind(&key.entity_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
            removed += result.rows_affected();
        }

        tx.commit().await.map_err(db_error)?;
        Ok(removed)
    }

    async fn find_assignments_by_group(
        &self,
        group_id: i64,
    ) -> Result<Vec<ContextAssignment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM context_assignments WHERE tax_group_id = ? ORDER BY id",
            ASSIGNMENT_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_assignment).collect()
    }

    async fn link_tax(
        &self,
        group_id: i64,
        tax_id: i64,
    ) -> Result<GroupTaxLink, RepositoryError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        if !exists(&mut tx, "tax_groups", group_id).await?
            || !exists(&mut tx, "taxes", tax_id).await?
        {
            return Err(RepositoryError::NotFound);
        }

        sqlx::query(
            "INSERT INTO group_tax_links (tax_group_id, tax_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT (tax_group_id, tax_id) DO NOTHING",
        )
        .bind(group_id)
        .bind(tax_id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let row = sqlx::query(
            "SELECT tax_group_id, tax_id, created_at FROM group_tax_links
             WHERE tax_group_id = ? AND tax_id = ?",
        )
        .bind(group_id)
        .bind(tax_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error)?;
        let link = row_to_link(&row)?;

        tx.commit().await.map_err(db_error)?;
        Ok(link)
    }

    async fn unlink_tax(
        &self,
        group_id: i64,
        tax_id: i64,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM group_tax_links WHERE tax_group_id = ? AND tax_id = ?")
            .bind(group_id)
            .bind(tax_id)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_tax_links(
        &self,
        group_id: i64,
    ) -> Result<Vec<GroupTaxLink>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT tax_group_id, tax_id, created_at FROM group_tax_links
             WHERE tax_group_id = ? ORDER BY tax_id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(row_to_link).collect()
    }
}
