use poem_openapi::{Enum, NewType};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct TeamId(pub Uuid);

impl TeamId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for TeamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct ModelId(pub Uuid);

impl ModelId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ModelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for UploadId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, NewType,
)]
pub struct ApiKeyId(pub Uuid);

impl ApiKeyId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for ApiKeyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of artifact a model row represents. Workflow kinds
/// (`ke`, `enterprise-search`) carry no trained weights of their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum)]
#[serde(rename_all = "kebab-case")]
#[oai(rename_all = "kebab-case")]
pub enum ModelType {
    Ndb,
    NlpText,
    NlpToken,
    NlpDoc,
    Ke,
    EnterpriseSearch,
}

impl ModelType {
    pub fn is_workflow(&self) -> bool {
        matches!(self, ModelType::Ke | ModelType::EnterpriseSearch)
    }
}

impl Display for ModelType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelType::Ndb => "ndb",
            ModelType::NlpText => "nlp-text",
            ModelType::NlpToken => "nlp-token",
            ModelType::NlpDoc => "nlp-doc",
            ModelType::Ke => "ke",
            ModelType::EnterpriseSearch => "enterprise-search",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ndb" => Ok(ModelType::Ndb),
            "nlp-text" => Ok(ModelType::NlpText),
            "nlp-token" => Ok(ModelType::NlpToken),
            "nlp-doc" => Ok(ModelType::NlpDoc),
            "ke" => Ok(ModelType::Ke),
            "enterprise-search" => Ok(ModelType::EnterpriseSearch),
            _ => Err(format!("Invalid model type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum TrainStatus {
    NotStarted,
    Starting,
    InProgress,
    Complete,
    Failed,
    Stopped,
}

impl TrainStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TrainStatus::Complete | TrainStatus::Failed | TrainStatus::Stopped
        )
    }

    /// Legal transitions of the training state machine. Terminal states have
    /// no successors; retraining always goes through a fresh model row.
    pub fn may_transition(&self, next: TrainStatus) -> bool {
        use TrainStatus::*;
        match (self, next) {
            (NotStarted, Starting) => true,
            (Starting, InProgress) => true,
            (InProgress, Complete) => true,
            (Starting | InProgress, Failed) => true,
            (NotStarted | Starting | InProgress, Stopped) => true,
            _ => false,
        }
    }
}

impl Display for TrainStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrainStatus::NotStarted => "not_started",
            TrainStatus::Starting => "starting",
            TrainStatus::InProgress => "in_progress",
            TrainStatus::Complete => "complete",
            TrainStatus::Failed => "failed",
            TrainStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TrainStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(TrainStatus::NotStarted),
            "starting" => Ok(TrainStatus::Starting),
            "in_progress" => Ok(TrainStatus::InProgress),
            "complete" => Ok(TrainStatus::Complete),
            "failed" => Ok(TrainStatus::Failed),
            "stopped" => Ok(TrainStatus::Stopped),
            _ => Err(format!("Invalid train status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum DeployStatus {
    NotStarted,
    Starting,
    InProgress,
    Complete,
    Failed,
    Stopped,
}

impl DeployStatus {
    /// A deployment is "settled" when no job is expected to be running for it.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            DeployStatus::NotStarted | DeployStatus::Failed | DeployStatus::Stopped
        )
    }

    /// Unlike training, a deployment can be restarted after it stopped,
    /// failed or completed; `Starting` is reachable from every settled state.
    pub fn may_transition(&self, next: DeployStatus) -> bool {
        use DeployStatus::*;
        match (self, next) {
            (NotStarted | Stopped | Failed | Complete, Starting) => true,
            (Starting, InProgress) => true,
            (InProgress, Complete) => true,
            (Starting | InProgress | Complete, Failed) => true,
            (Starting | InProgress | Complete, Stopped) => true,
            _ => false,
        }
    }
}

impl Display for DeployStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeployStatus::NotStarted => "not_started",
            DeployStatus::Starting => "starting",
            DeployStatus::InProgress => "in_progress",
            DeployStatus::Complete => "complete",
            DeployStatus::Failed => "failed",
            DeployStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for DeployStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(DeployStatus::NotStarted),
            "starting" => Ok(DeployStatus::Starting),
            "in_progress" => Ok(DeployStatus::InProgress),
            "complete" => Ok(DeployStatus::Complete),
            "failed" => Ok(DeployStatus::Failed),
            "stopped" => Ok(DeployStatus::Stopped),
            _ => Err(format!("Invalid deploy status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum ModelAccess {
    Private,
    Protected,
    Public,
}

impl Display for ModelAccess {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelAccess::Private => "private",
            ModelAccess::Protected => "protected",
            ModelAccess::Public => "public",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ModelAccess {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(ModelAccess::Private),
            "protected" => Ok(ModelAccess::Protected),
            "public" => Ok(ModelAccess::Public),
            _ => Err(format!("Invalid model access: {s}")),
        }
    }
}

/// The permission non-owners receive on a public model, or on a protected
/// model within its team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum DefaultPermission {
    Read,
    Write,
}

impl Display for DefaultPermission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultPermission::Read => write!(f, "read"),
            DefaultPermission::Write => write!(f, "write"),
        }
    }
}

impl FromStr for DefaultPermission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(DefaultPermission::Read),
            "write" => Ok(DefaultPermission::Write),
            _ => Err(format!("Invalid default permission: {s}")),
        }
    }
}

/// The permission lattice. Ordering matters: guards are expressed as
/// `permission >= required`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum ModelPermission {
    None,
    Read,
    Write,
    Owner,
}

impl From<DefaultPermission> for ModelPermission {
    fn from(value: DefaultPermission) -> Self {
        match value {
            DefaultPermission::Read => ModelPermission::Read,
            DefaultPermission::Write => ModelPermission::Write,
        }
    }
}

impl Display for ModelPermission {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ModelPermission::None => "none",
            ModelPermission::Read => "read",
            ModelPermission::Write => "write",
            ModelPermission::Owner => "owner",
        };
        write!(f, "{s}")
    }
}

/// Team membership facts needed for permission resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeamMembership {
    pub is_team_admin: bool,
}

/// Resolves the permission a user holds on a model. Total over all inputs;
/// `membership` is the caller's membership in the model's team, if any.
pub fn resolve_model_permission(
    user_id: UserId,
    is_admin: bool,
    model_owner: UserId,
    access: ModelAccess,
    default_permission: DefaultPermission,
    membership: Option<TeamMembership>,
) -> ModelPermission {
    if is_admin || user_id == model_owner {
        return ModelPermission::Owner;
    }
    match access {
        ModelAccess::Public => default_permission.into(),
        ModelAccess::Protected => match membership {
            Some(m) if m.is_team_admin => ModelPermission::Owner,
            Some(_) => default_permission.into(),
            None => ModelPermission::None,
        },
        ModelAccess::Private => ModelPermission::None,
    }
}

/// Severity of a job-reported log line; only warnings and errors are
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize, Enum)]
#[serde(rename_all = "snake_case")]
#[oai(rename_all = "snake_case")]
pub enum JobLogLevel {
    Warning,
    Error,
}

impl Display for JobLogLevel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobLogLevel::Warning => write!(f, "warning"),
            JobLogLevel::Error => write!(f, "error"),
        }
    }
}

impl FromStr for JobLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(JobLogLevel::Warning),
            "error" => Ok(JobLogLevel::Error),
            _ => Err(format!("Invalid job log level: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn uid() -> UserId {
        UserId::new_v4()
    }

    #[test]
    fn train_status_happy_path() {
        assert!(TrainStatus::NotStarted.may_transition(TrainStatus::Starting));
        assert!(TrainStatus::Starting.may_transition(TrainStatus::InProgress));
        assert!(TrainStatus::InProgress.may_transition(TrainStatus::Complete));
        assert!(TrainStatus::InProgress.may_transition(TrainStatus::Failed));
    }

    #[test]
    fn train_status_terminal_states_are_sticky() {
        for terminal in [
            TrainStatus::Complete,
            TrainStatus::Failed,
            TrainStatus::Stopped,
        ] {
            for next in [
                TrainStatus::NotStarted,
                TrainStatus::Starting,
                TrainStatus::InProgress,
                TrainStatus::Complete,
                TrainStatus::Failed,
                TrainStatus::Stopped,
            ] {
                assert!(
                    !terminal.may_transition(next),
                    "{terminal} -> {next} must be refused"
                );
            }
        }
    }

    #[test]
    fn train_status_cannot_skip_to_complete() {
        assert!(!TrainStatus::NotStarted.may_transition(TrainStatus::Complete));
        assert!(!TrainStatus::Starting.may_transition(TrainStatus::Complete));
    }

    #[test]
    fn deploy_status_can_restart_after_stop_and_failure() {
        assert!(DeployStatus::Stopped.may_transition(DeployStatus::Starting));
        assert!(DeployStatus::Failed.may_transition(DeployStatus::Starting));
        assert!(DeployStatus::Complete.may_transition(DeployStatus::Starting));
        assert!(!DeployStatus::InProgress.may_transition(DeployStatus::Starting));
    }

    #[test]
    fn deploy_status_stopped_cannot_regress_to_in_progress() {
        assert!(!DeployStatus::Stopped.may_transition(DeployStatus::InProgress));
        assert!(!DeployStatus::Stopped.may_transition(DeployStatus::Complete));
    }

    #[test]
    fn permission_admin_is_owner_everywhere() {
        let user = uid();
        let owner = uid();
        let permission = resolve_model_permission(
            user,
            true,
            owner,
            ModelAccess::Private,
            DefaultPermission::Read,
            None,
        );
        assert_eq!(permission, ModelPermission::Owner);
    }

    #[test]
    fn permission_owner_of_private_model() {
        let user = uid();
        let permission = resolve_model_permission(
            user,
            false,
            user,
            ModelAccess::Private,
            DefaultPermission::Read,
            None,
        );
        assert_eq!(permission, ModelPermission::Owner);
    }

    #[test]
    fn permission_public_follows_default() {
        let user = uid();
        let owner = uid();
        assert_eq!(
            resolve_model_permission(
                user,
                false,
                owner,
                ModelAccess::Public,
                DefaultPermission::Read,
                None
            ),
            ModelPermission::Read
        );
        assert_eq!(
            resolve_model_permission(
                user,
                false,
                owner,
                ModelAccess::Public,
                DefaultPermission::Write,
                None
            ),
            ModelPermission::Write
        );
    }

    #[test]
    fn permission_protected_requires_membership() {
        let user = uid();
        let owner = uid();
        assert_eq!(
            resolve_model_permission(
                user,
                false,
                owner,
                ModelAccess::Protected,
                DefaultPermission::Write,
                None
            ),
            ModelPermission::None
        );
        assert_eq!(
            resolve_model_permission(
                user,
                false,
                owner,
                ModelAccess::Protected,
                DefaultPermission::Read,
                Some(TeamMembership {
                    is_team_admin: false
                })
            ),
            ModelPermission::Read
        );
        assert_eq!(
            resolve_model_permission(
                user,
                false,
                owner,
                ModelAccess::Protected,
                DefaultPermission::Read,
                Some(TeamMembership {
                    is_team_admin: true
                })
            ),
            ModelPermission::Owner
        );
    }

    #[test]
    fn permission_is_monotone_in_promotions() {
        let user = uid();
        let owner = uid();
        // regular member -> team admin
        let before = resolve_model_permission(
            user,
            false,
            owner,
            ModelAccess::Protected,
            DefaultPermission::Read,
            Some(TeamMembership {
                is_team_admin: false,
            }),
        );
        let after = resolve_model_permission(
            user,
            false,
            owner,
            ModelAccess::Protected,
            DefaultPermission::Read,
            Some(TeamMembership {
                is_team_admin: true,
            }),
        );
        assert!(after >= before);
        // regular user -> platform admin
        let after_admin = resolve_model_permission(
            user,
            true,
            owner,
            ModelAccess::Private,
            DefaultPermission::Read,
            None,
        );
        assert!(after_admin >= before);
    }

    #[test]
    fn permission_ordering() {
        assert!(ModelPermission::None < ModelPermission::Read);
        assert!(ModelPermission::Read < ModelPermission::Write);
        assert!(ModelPermission::Write < ModelPermission::Owner);
    }

    #[test]
    fn model_type_round_trips_through_strings() {
        for t in [
            ModelType::Ndb,
            ModelType::NlpText,
            ModelType::NlpToken,
            ModelType::NlpDoc,
            ModelType::Ke,
            ModelType::EnterpriseSearch,
        ] {
            assert_eq!(t.to_string().parse::<ModelType>(), Ok(t));
        }
        assert!("tensor-soup".parse::<ModelType>().is_err());
    }
}
