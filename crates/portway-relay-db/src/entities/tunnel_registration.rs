//! TunnelRegistration entity: durable metadata for one claimed subdomain

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tunnel_registrations")]
pub struct Model {
    /// Subdomain label (primary key, so claims are unique per subdomain)
    #[sea_orm(primary_key, auto_increment = false)]
    pub subdomain: String,

    /// Live tunnel currently holding the claim
    pub tunnel_id: String,

    pub local_port: i32,

    pub local_host: String,

    /// Argon2id PHC string
    #[sea_orm(column_type = "Text", nullable)]
    pub password_hash: Option<String>,

    /// Raw allow-list as supplied at registration
    #[sea_orm(column_type = "Text", nullable)]
    pub ip_allow_list: Option<String>,

    pub expires_at: Option<ChronoDateTimeUtc>,

    pub inspect: bool,

    pub total_requests: i64,

    pub is_active: bool,

    pub last_active_at: ChronoDateTimeUtc,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
