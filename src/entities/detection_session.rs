use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "detection_sessions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_fire_detections: i32,
    pub total_smoke_detections: i32,
    pub status: String,
}

/// Lifecycle of a monitoring session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::detection_log::Entity")]
    DetectionLogs,
}

impl Related<super::detection_log::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DetectionLogs.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
