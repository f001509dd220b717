//! Create the tunnel_registrations table

use sea_orm_migration::{prelude::*, schema::*};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(TunnelRegistrations::Table)
                    .if_not_exists()
                    .col(string_len(TunnelRegistrations::Subdomain, 63).primary_key())
                    .col(string_len(TunnelRegistrations::TunnelId, 64).not_null())
                    .col(integer(TunnelRegistrations::LocalPort).not_null())
                    .col(
                        string_len(TunnelRegistrations::LocalHost, 255)
                            .not_null()
                            .default("localhost"),
                    )
                    .col(text_null(TunnelRegistrations::PasswordHash))
                    .col(text_null(TunnelRegistrations::IpAllowList))
                    .col(timestamp_with_time_zone_null(TunnelRegistrations::ExpiresAt))
                    .col(boolean(TunnelRegistrations::Inspect).not_null().default(false))
                    .col(
                        big_integer(TunnelRegistrations::TotalRequests)
                            .not_null()
                            .default(0),
                    )
                    .col(boolean(TunnelRegistrations::IsActive).not_null().default(true))
                    .col(
                        timestamp_with_time_zone(TunnelRegistrations::LastActiveAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        timestamp_with_time_zone(TunnelRegistrations::CreatedAt)
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // Active-tunnel listings filter on is_active
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_tunnel_registrations_is_active")
                    .table(TunnelRegistrations::Table)
                    .col(TunnelRegistrations::IsActive)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(TunnelRegistrations::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum TunnelRegistrations {
    #[sea_orm(iden = "tunnel_registrations")]
    Table,
    Subdomain,
    TunnelId,
    LocalPort,
    LocalHost,
    PasswordHash,
    IpAllowList,
    ExpiresAt,
    Inspect,
    TotalRequests,
    IsActive,
    LastActiveAt,
    CreatedAt,
}
