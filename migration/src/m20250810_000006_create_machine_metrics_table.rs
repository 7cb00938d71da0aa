use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("machine_metrics"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).string().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("machine_id")).string().not_null())
                    .col(ColumnDef::new(Alias::new("timestamp")).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Alias::new("cpu_usage_percent")).double().not_null())
                    .col(ColumnDef::new(Alias::new("memory_used_bytes")).big_integer().not_null())
                    .col(ColumnDef::new(Alias::new("memory_total_bytes")).big_integer().not_null())
                    .col(ColumnDef::new(Alias::new("disk_used_bytes")).big_integer().not_null())
                    .col(ColumnDef::new(Alias::new("disk_total_bytes")).big_integer().not_null())
                    .col(ColumnDef::new(Alias::new("network_rx_bytes")).big_integer().not_null())
                    .col(ColumnDef::new(Alias::new("network_tx_bytes")).big_integer().not_null())
                    .col(ColumnDef::new(Alias::new("load_average_1")).double().not_null())
                    .col(ColumnDef::new(Alias::new("load_average_5")).double().not_null())
                    .col(ColumnDef::new(Alias::new("load_average_15")).double().not_null())
                    .col(ColumnDef::new(Alias::new("temperature")).double().null())
                    .col(ColumnDef::new(Alias::new("power_state")).string().not_null())
                    .col(ColumnDef::new(Alias::new("uptime_seconds")).big_integer().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-machine-metrics-machine")
                            .from(Alias::new("machine_metrics"), Alias::new("machine_id"))
                            .to(Alias::new("machines"), Alias::new("id"))
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-machine-metrics-machine-id")
                    .table(Alias::new("machine_metrics"))
                    .col(Alias::new("machine_id"))
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alias::new("machine_metrics")).to_owned())
            .await
    }
}
