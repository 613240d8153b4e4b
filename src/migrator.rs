use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_detections_table::Migration),
            Box::new(m20250101_000002_create_detection_sessions_table::Migration),
            Box::new(m20250101_000003_create_detection_logs_table::Migration),
        ]
    }
}

mod m20250101_000001_create_detections_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_detections_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Detections::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Detections::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(Detections::Timestamp)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(ColumnDef::new(Detections::DetectionType).string().not_null())
                        .col(ColumnDef::new(Detections::Count).integer().not_null())
                        .col(ColumnDef::new(Detections::Confidence).double().null())
                        .col(ColumnDef::new(Detections::ImagePath).string().null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_detections_timestamp")
                        .table(Detections::Table)
                        .col(Detections::Timestamp)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Detections::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Detections {
        Table,
        Id,
        Timestamp,
        DetectionType,
        Count,
        Confidence,
        ImagePath,
    }
}

mod m20250101_000002_create_detection_sessions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_detection_sessions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(DetectionSessions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DetectionSessions::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(DetectionSessions::StartTime)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(DetectionSessions::EndTime)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(DetectionSessions::TotalFireDetections)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(DetectionSessions::TotalSmokeDetections)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(DetectionSessions::Status)
                                .string()
                                .not_null()
                                .default("active"),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_detection_sessions_start_time")
                        .table(DetectionSessions::Table)
                        .col(DetectionSessions::StartTime)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(DetectionSessions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum DetectionSessions {
        Table,
        Id,
        StartTime,
        EndTime,
        TotalFireDetections,
        TotalSmokeDetections,
        Status,
    }
}

mod m20250101_000003_create_detection_logs_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_detection_logs_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(DetectionLogs::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DetectionLogs::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(DetectionLogs::SessionId).integer().not_null())
                        .col(
                            ColumnDef::new(DetectionLogs::Timestamp)
                                .timestamp_with_time_zone()
                                .not_null()
                                .default(Expr::current_timestamp()),
                        )
                        .col(
                            ColumnDef::new(DetectionLogs::FireCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(DetectionLogs::SmokeCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(DetectionLogs::AlertTriggered)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_detection_logs_session_id")
                                .from(DetectionLogs::Table, DetectionLogs::SessionId)
                                .to(DetectionSessions::Table, DetectionSessions::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_detection_logs_session_id")
                        .table(DetectionLogs::Table)
                        .col(DetectionLogs::SessionId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(DetectionLogs::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum DetectionLogs {
        Table,
        Id,
        SessionId,
        Timestamp,
        FireCount,
        SmokeCount,
        AlertTriggered,
    }

    #[derive(DeriveIden)]
    enum DetectionSessions {
        Table,
        Id,
    }
}
