use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Request to seat a participant at a committed group
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AssignUserRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "user_id", rename = "userId")]
    pub user_id: String,
    #[serde(alias = "group_id", rename = "groupId")]
    pub group_id: Uuid,
    #[serde(default, rename = "expectedVersion")]
    pub expected_version: Option<i64>,
}

/// Request to move a participant between two groups of the same run
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MoveUserRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "user_id", rename = "userId")]
    pub user_id: String,
    #[serde(alias = "from_group_id", rename = "fromGroupId")]
    pub from_group_id: Uuid,
    #[serde(alias = "to_group_id", rename = "toGroupId")]
    pub to_group_id: Uuid,
    #[serde(default, rename = "expectedFromVersion")]
    pub expected_from_version: Option<i64>,
    #[serde(default, rename = "expectedToVersion")]
    pub expected_to_version: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RemoveUserRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "user_id", rename = "userId")]
    pub user_id: String,
    #[serde(alias = "group_id", rename = "groupId")]
    pub group_id: Uuid,
    #[serde(default, rename = "expectedVersion")]
    pub expected_version: Option<i64>,
}

/// Request to create a group by hand; bounds default to the configured policy
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateGroupRequest {
    #[validate(length(min = 1))]
    #[serde(alias = "member_ids", rename = "memberIds")]
    pub member_ids: Vec<String>,
    #[serde(default, alias = "min_size", rename = "minSize")]
    pub min_size: Option<usize>,
    #[serde(default, alias = "max_size", rename = "maxSize")]
    pub max_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BulkAssignRequest {
    #[validate(length(min = 1, max = 500), nested)]
    pub assignments: Vec<AssignUserRequest>,
}
