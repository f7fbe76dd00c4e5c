use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(m20250301_000001_create_checkout_tables::Migration)]
    }
}

mod m20250301_000001_create_checkout_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250301_000001_create_checkout_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        #[allow(elided_lifetimes_in_paths)]
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Checkouts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Checkouts::Id).uuid().primary_key().not_null())
                        .col(ColumnDef::new(Checkouts::State).string().not_null())
                        .col(ColumnDef::new(Checkouts::PmsReservationId).string())
                        .col(ColumnDef::new(Checkouts::HoldExpiresAt).timestamp_with_time_zone())
                        .col(
                            ColumnDef::new(Checkouts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Checkouts::Revision)
                                .big_integer()
                                .not_null()
                                .default(1),
                        )
                        .col(ColumnDef::new(Checkouts::Doc).json_binary().not_null())
                        .to_owned(),
                )
                .await?;

            // The sweeper scans (state, hold_expires_at) ranges
            manager
                .create_index(
                    Index::create()
                        .name("idx_checkouts_state_hold_expires_at")
                        .table(Checkouts::Table)
                        .col(Checkouts::State)
                        .col(Checkouts::HoldExpiresAt)
                        .to_owned(),
                )
                .await?;

            // The reconciliation task resolves reservation ownership
            manager
                .create_index(
                    Index::create()
                        .name("idx_checkouts_pms_reservation_id")
                        .table(Checkouts::Table)
                        .col(Checkouts::PmsReservationId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(IdempotencyKeys::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(IdempotencyKeys::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(IdempotencyKeys::Endpoint).string().not_null())
                        .col(
                            ColumnDef::new(IdempotencyKeys::IdempotencyKey)
                                .string()
                                .not_null(),
                        )
                        .col(ColumnDef::new(IdempotencyKeys::Status).small_integer())
                        .col(ColumnDef::new(IdempotencyKeys::Body).json_binary())
                        .col(
                            ColumnDef::new(IdempotencyKeys::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(IdempotencyKeys::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_idempotency_keys_expires_at")
                        .table(IdempotencyKeys::Table)
                        .col(IdempotencyKeys::ExpiresAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WebhookEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WebhookEvents::Id)
                                .string()
                                .primary_key()
                                .not_null(),
                        )
                        .col(ColumnDef::new(WebhookEvents::ProcessedAt).timestamp_with_time_zone())
                        .col(
                            ColumnDef::new(WebhookEvents::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_webhook_events_expires_at")
                        .table(WebhookEvents::Table)
                        .col(WebhookEvents::ExpiresAt)
                        .to_owned(),
                )
                .await
        }

        #[allow(elided_lifetimes_in_paths)]
        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WebhookEvents::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(IdempotencyKeys::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Checkouts::Table).to_owned())
                .await
        }
    }

    #[derive(Iden)]
    enum Checkouts {
        Table,
        Id,
        State,
        PmsReservationId,
        HoldExpiresAt,
        UpdatedAt,
        Revision,
        Doc,
    }

    #[derive(Iden)]
    enum IdempotencyKeys {
        Table,
        Id,
        Endpoint,
        IdempotencyKey,
        Status,
        Body,
        CreatedAt,
        ExpiresAt,
    }

    #[derive(Iden)]
    enum WebhookEvents {
        Table,
        Id,
        ProcessedAt,
        ExpiresAt,
    }
}
