use sea_orm_migration::{prelude::*, sea_orm::DatabaseBackend};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .if_not_exists()
                    .table(IdempotencyRecords::Table)
                    .col(pk_id_col(manager, IdempotencyRecords::Id))
                    .col(uuid_col(IdempotencyRecords::Uuid))
                    .col(
                        ColumnDef::new(IdempotencyRecords::Key)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IdempotencyRecords::RequestHash)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(IdempotencyRecords::State)
                            .string_len(32)
                            .not_null()
                            .default(Expr::val("pending")),
                    )
                    .col(ColumnDef::new(IdempotencyRecords::ResponseStatus).integer())
                    .col(ColumnDef::new(IdempotencyRecords::ResponseBody).text())
                    .col(ColumnDef::new(IdempotencyRecords::UserId).string_len(255))
                    .col(ColumnDef::new(IdempotencyRecords::OrganizationId).string_len(255))
                    .col(ColumnDef::new(IdempotencyRecords::Endpoint).string_len(255))
                    .col(timestamp_col(IdempotencyRecords::CreatedAt))
                    .col(
                        ColumnDef::new(IdempotencyRecords::ExpiresAt)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // The unique index is what makes claim-by-insert atomic: a concurrent
        // insert for the same key fails instead of creating a second record.
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_idempotency_records_key")
                    .table(IdempotencyRecords::Table)
                    .col(IdempotencyRecords::Key)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_idempotency_records_uuid")
                    .table(IdempotencyRecords::Table)
                    .col(IdempotencyRecords::Uuid)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_idempotency_records_expires_at")
                    .table(IdempotencyRecords::Table)
                    .col(IdempotencyRecords::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(IdempotencyRecords::Table).to_owned())
            .await?;
        Ok(())
    }
}

fn pk_id_col<T: Iden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut col = ColumnDef::new(col);
    match manager.get_database_backend() {
        DatabaseBackend::Sqlite => {
            col.integer();
        }
        _ => {
            col.big_integer();
        }
    }
    col.not_null().auto_increment().primary_key().to_owned()
}

fn uuid_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().not_null().to_owned()
}

fn timestamp_col<T: Iden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp()
        .not_null()
        .default(Expr::current_timestamp())
        .to_owned()
}

#[derive(Iden)]
enum IdempotencyRecords {
    Table,
    Id,
    Uuid,
    Key,
    RequestHash,
    State,
    ResponseStatus,
    ResponseBody,
    UserId,
    OrganizationId,
    Endpoint,
    CreatedAt,
    ExpiresAt,
}
