pub use sea_orm_migration::prelude::*;

mod m20250810_000001_create_machines_table;
mod m20250810_000002_create_builds_table;
mod m20250810_000003_create_users_table;
mod m20250810_000004_create_groups_tables;
mod m20250810_000005_create_power_operations_table;
mod m20250810_000006_create_machine_metrics_table;
mod m20250810_000007_create_image_tests_table;
mod m20250810_000008_create_webhooks_tables;
mod m20250810_000009_create_machine_templates_table;
mod m20250810_000010_create_machine_events_table;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250810_000001_create_machines_table::Migration),
            Box::new(m20250810_000002_create_builds_table::Migration),
            Box::new(m20250810_000003_create_users_table::Migration),
            Box::new(m20250810_000004_create_groups_tables::Migration),
            Box::new(m20250810_000005_create_power_operations_table::Migration),
            Box::new(m20250810_000006_create_machine_metrics_table::Migration),
            Box::new(m20250810_000007_create_image_tests_table::Migration),
            Box::new(m20250810_000008_create_webhooks_tables::Migration),
            Box::new(m20250810_000009_create_machine_templates_table::Migration),
            Box::new(m20250810_000010_create_machine_events_table::Migration),
        ]
    }
}
