use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A change of the live fire/smoke counts recorded inside a session.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "detection_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub session_id: i32,
    pub timestamp: DateTime<Utc>,
    pub fire_count: i32,
    pub smoke_count: i32,
    pub alert_triggered: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::detection_session::Entity",
        from = "Column::SessionId",
        to = "super::detection_session::Column::Id",
        on_delete = "Cascade"
    )]
    DetectionSession,
}

impl Related<super::detection_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::DetectionSession.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
