use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Alias::new("image_tests"))
                    .if_not_exists()
                    .col(ColumnDef::new(Alias::new("id")).string().not_null().primary_key())
                    .col(ColumnDef::new(Alias::new("image_path")).string().not_null())
                    .col(ColumnDef::new(Alias::new("image_type")).string().not_null())
                    .col(ColumnDef::new(Alias::new("test_type")).string().not_null())
                    .col(ColumnDef::new(Alias::new("status")).string().not_null())
                    .col(ColumnDef::new(Alias::new("result")).text().null())
                    .col(ColumnDef::new(Alias::new("error")).text().null())
                    .col(ColumnDef::new(Alias::new("machine_id")).string().null())
                    .col(ColumnDef::new(Alias::new("created_at")).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(Alias::new("completed_at")).timestamp_with_time_zone().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-image-tests-machine")
                            .from(Alias::new("image_tests"), Alias::new("machine_id"))
                            .to(Alias::new("machines"), Alias::new("id"))
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-image-tests-machine-id")
                    .table(Alias::new("image_tests"))
                    .col(Alias::new("machine_id"))
                    .if_not_exists()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Alias::new("image_tests")).to_owned())
            .await
    }
}
