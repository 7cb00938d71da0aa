use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("webhooks"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).string().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("name")).string().not_null())
                    .col(ColumnDef::new(Alias::new("url")).string().not_null())
                    .col(ColumnDef::new(Alias::new("events")).json_binary().not_null())
                    .col(ColumnDef::new(Alias::new("secret")).string().null())
                    .col(ColumnDef::new(Alias::new("active")).boolean().not_null().default(true))
                    .col(ColumnDef::new(Alias::new("headers")).json_binary().null())
                    .col(ColumnDef::new(Alias::new("timeout_seconds")).integer().not_null().default(30))
                    .col(ColumnDef::new(Alias::new("max_retries")).integer().not_null().default(3))
                    .col(ColumnDef::new(Alias::new("last_success")).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(Alias::new("last_failure")).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(Alias::new("created_at")).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Alias::new("updated_at")).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(Alias::new("webhook_deliveries"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).string().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("webhook_id")).string().not_null())
                    .col(ColumnDef::new(Alias::new("event")).string().not_null())
                    .col(ColumnDef::new(Alias::new("payload")).text().not_null())
                    .col(ColumnDef::new(Alias::new("status_code")).integer().not_null())
                    .col(ColumnDef::new(Alias::new("response")).text().null())
                    .col(ColumnDef::new(Alias::new("error")).text().null())
                    .col(ColumnDef::new(Alias::new("attempts")).integer().not_null().default(1))
                    .col(ColumnDef::new(Alias::new("success")).boolean().not_null())
                    .col(ColumnDef::new(Alias::new("created_at")).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Alias::new("completed_at")).timestamp_with_time_zone().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-webhook-deliveries-webhook")
                            .from(Alias::new("webhook_deliveries"), Alias::new("webhook_id"))
                            .to(Alias::new("webhooks"), Alias::new("id"))
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-webhook-deliveries-webhook-id")
                    .table(Alias::new("webhook_deliveries"))
                    .col(Alias::new("webhook_id"))
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alias::new("webhook_deliveries")).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Alias::new("webhooks")).to_owned())
            .await
    }
}
