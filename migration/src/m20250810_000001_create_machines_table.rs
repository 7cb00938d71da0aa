use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("machines"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).string().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("service_tag")).string().not_null().unique_key())
                    .col(ColumnDef::new(Alias::new("mac_address")).string().not_null())
                    .col(ColumnDef::new(Alias::new("status")).string().not_null())
                    .col(ColumnDef::new(Alias::new("hostname")).string().null())
                    .col(ColumnDef::new(Alias::new("description")).string().null())
                    .col(ColumnDef::new(Alias::new("hardware")).json_binary().not_null())
                    .col(ColumnDef::new(Alias::new("nixos_config")).text().null())
                    .col(ColumnDef::new(Alias::new("last_build_id")).string().null())
                    .col(ColumnDef::new(Alias::new("last_build_time")).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(Alias::new("bmc_info")).json_binary().null())
                    .col(ColumnDef::new(Alias::new("enrolled_at")).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Alias::new("updated_at")).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Alias::new("last_seen_at")).timestamp_with_time_zone().null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alias::new("machines")).to_owned())
            .await
    }
}
