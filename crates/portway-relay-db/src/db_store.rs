//! SeaORM-backed tunnel store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::prelude::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait,
    QueryFilter, Set, SqlErr,
};
use std::time::Duration;
use tracing::debug;

use crate::entities::tunnel_registration::{self, Column, Entity};
use crate::store::{NewRegistration, StoreError, TunnelRegistration, TunnelStore};

/// Default window after which an active but silent claim can be taken over
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);

pub struct DbTunnelStore {
    db: DatabaseConnection,
    stale_after: chrono::Duration,
}

impl DbTunnelStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self {
            db,
            stale_after: to_chrono(DEFAULT_STALE_AFTER),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = to_chrono(stale_after);
        self
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

#[async_trait]
impl TunnelStore for DbTunnelStore {
    async fn claim(&self, new: NewRegistration) -> Result<TunnelRegistration, StoreError> {
        let now = Utc::now();
        let subdomain = new.subdomain.clone();

        let fresh = tunnel_registration::ActiveModel {
            subdomain: Set(new.subdomain.clone()),
            tunnel_id: Set(new.tunnel_id.clone()),
            local_port: Set(i32::from(new.local_port)),
            local_host: Set(new.local_host.clone()),
            password_hash: Set(new.password_hash.clone()),
            ip_allow_list: Set(new.ip_allow_list.clone()),
            expires_at: Set(new.expires_at),
            inspect: Set(new.inspect),
            total_requests: Set(0),
            is_active: Set(true),
            last_active_at: Set(now),
            created_at: Set(now),
        };

        match fresh.insert(&self.db).await {
            Ok(model) => return TunnelRegistration::try_from(model),
            Err(e) if is_unique_violation(&e) => {
                debug!("Subdomain '{}' has a row, attempting takeover", subdomain);
            }
            Err(e) => return Err(e.into()),
        }

        // The row exists. Take it over only if it is inactive or stale; the
        // WHERE clause makes this a single atomic compare-and-set.
        let stale_before = now
            .checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let result = Entity::update_many()
            .col_expr(Column::TunnelId, Expr::value(new.tunnel_id))
            .col_expr(Column::LocalPort, Expr::value(i32::from(new.local_port)))
            .col_expr(Column::LocalHost, Expr::value(new.local_host))
            .col_expr(Column::PasswordHash, Expr::value(new.password_hash))
            .col_expr(Column::IpAllowList, Expr::value(new.ip_allow_list))
            .col_expr(Column::ExpiresAt, Expr::value(new.expires_at))
            .col_expr(Column::Inspect, Expr::value(new.inspect))
            .col_expr(Column::IsActive, Expr::value(true))
            .col_expr(Column::LastActiveAt, Expr::value(now))
            .filter(Column::Subdomain.eq(subdomain.as_str()))
            .filter(
                Condition::any()
                    .add(Column::IsActive.eq(false))
                    .add(Column::LastActiveAt.lt(stale_before)),
            )
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            return Err(StoreError::Conflict(subdomain));
        }

        self.find_by_subdomain(&subdomain)
            .await?
            .ok_or(StoreError::Conflict(subdomain))
    }

    async fn find_by_subdomain(
        &self,
        subdomain: &str,
    ) -> Result<Option<TunnelRegistration>, StoreError> {
        Entity::find_by_id(subdomain.to_string())
            .one(&self.db)
            .await?
            .map(TunnelRegistration::try_from)
            .transpose()
    }

    async fn record_activity(&self, subdomain: &str, requests: u64) -> Result<(), StoreError> {
        let increment = i64::try_from(requests).unwrap_or(i64::MAX);
        Entity::update_many()
            .col_expr(
                Column::TotalRequests,
                Expr::col(Column::TotalRequests).add(increment),
            )
            .col_expr(Column::LastActiveAt, Expr::value(Utc::now()))
            .filter(Column::Subdomain.eq(subdomain))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn deactivate(&self, subdomain: &str, tunnel_id: &str) -> Result<bool, StoreError> {
        let result = Entity::update_many()
            .col_expr(Column::IsActive, Expr::value(false))
            .filter(Column::Subdomain.eq(subdomain))
            .filter(Column::TunnelId.eq(tunnel_id))
            .filter(Column::IsActive.eq(true))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn list_active(&self) -> Result<Vec<TunnelRegistration>, StoreError> {
        Entity::find()
            .filter(Column::IsActive.eq(true))
            .all(&self.db)
            .await?
            .into_iter()
            .map(TunnelRegistration::try_from)
            .collect()
    }
}
