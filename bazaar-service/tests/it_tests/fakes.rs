//! Map-backed repo implementations mirroring the Postgres semantics the
//! services rely on: unique violations, the last-admin guard, dependency
//! cycle refusal and guarded status transitions.

use async_trait::async_trait;
use bazaar_common::model::{
    DefaultPermission, DeployStatus, JobLogLevel, ModelAccess, ModelId, ModelType, TeamId,
    TrainStatus, UserId,
};
use bazaar_service::model::{
    ApiKey, JobLogEntry, Model, ModelDetail, Team, TeamMember, UploadSession, User,
};
use bazaar_service::repo::api_key::{ApiKeyRecord, ApiKeyRepo};
use bazaar_service::repo::model::{AddDependencyOutcome, ModelDeleteOutcome, ModelRepo};
use bazaar_service::repo::team::TeamRepo;
use bazaar_service::repo::upload::UploadRepo;
use bazaar_service::repo::user::{AdminFlagOutcome, UserDeleteOutcome, UserRepo};
use bazaar_service::repo::{RepoError, TransitionOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

pub fn unique_violation(constraint: &str) -> RepoError {
    RepoError::UniqueViolation(constraint.to_string())
}

pub fn test_user(is_admin: bool) -> User {
    let id = UserId::new_v4();
    User {
        id,
        username: format!("user-{id}"),
        email: format!("{id}@example.com"),
        password_hash: None,
        is_admin,
        is_verified: true,
    }
}

pub fn test_model(owner: &User, name: &str, model_type: ModelType) -> Model {
    Model {
        id: ModelId::new_v4(),
        name: name.to_string(),
        model_type,
        published_date: Utc::now(),
        train_status: TrainStatus::NotStarted,
        deploy_status: DeployStatus::NotStarted,
        access: ModelAccess::Private,
        default_permission: DefaultPermission::Read,
        deployment_name: None,
        base_model_id: None,
        user_id: owner.id,
        team_id: None,
    }
}

#[derive(Default)]
pub struct InMemoryModelRepo {
    pub models: Mutex<HashMap<Uuid, Model>>,
    pub dependencies: Mutex<HashSet<(Uuid, Uuid)>>,
    pub attributes: Mutex<HashMap<(Uuid, String), String>>,
    pub logs: Mutex<Vec<JobLogEntry>>,
}

impl InMemoryModelRepo {
    pub fn with_models(models: impl IntoIterator<Item = Model>) -> Self {
        let repo = Self::default();
        {
            let mut map = repo.models.lock();
            for model in models {
                map.insert(model.id.0, model);
            }
        }
        repo
    }

    fn reachable_from(&self, start: Uuid) -> HashSet<Uuid> {
        let dependencies = self.dependencies.lock();
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for (from, to) in dependencies.iter() {
                if *from == node && seen.insert(*to) {
                    stack.push(*to);
                }
            }
        }
        seen
    }
}

#[async_trait]
impl ModelRepo for InMemoryModelRepo {
    async fn create(&self, model: &Model) -> Result<(), RepoError> {
        let mut models = self.models.lock();
        if models
            .values()
            .any(|m| m.user_id == model.user_id && m.name == model.name)
        {
            return Err(unique_violation("models_user_name_unique"));
        }
        if let Some(name) = &model.deployment_name {
            if models
                .values()
                .any(|m| m.deployment_name.as_deref() == Some(name))
            {
                return Err(unique_violation("models_deployment_name_unique"));
            }
        }
        models.insert(model.id.0, model.clone());
        Ok(())
    }

    async fn get(&self, id: &ModelId) -> Result<Option<Model>, RepoError> {
        Ok(self.models.lock().get(&id.0).cloned())
    }

    async fn get_by_owner_and_name(
        &self,
        user_id: &UserId,
        name: &str,
    ) -> Result<Option<Model>, RepoError> {
        Ok(self
            .models
            .lock()
            .values()
            .find(|m| m.user_id == *user_id && m.name == name)
            .cloned())
    }

    async fn get_detail(&self, id: &ModelId) -> Result<Option<ModelDetail>, RepoError> {
        let Some(model) = self.models.lock().get(&id.0).cloned() else {
            return Ok(None);
        };
        let attributes: BTreeMap<String, String> = self
            .attributes
            .lock()
            .iter()
            .filter(|((model_id, _), _)| *model_id == id.0)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect();
        let dependencies = self.dependencies_of(id).await?;
        Ok(Some(ModelDetail {
            model,
            owner_username: "owner".to_string(),
            attributes,
            dependencies,
        }))
    }

    async fn list_visible(
        &self,
        user_id: &UserId,
        is_admin: bool,
    ) -> Result<Vec<Model>, RepoError> {
        Ok(self
            .models
            .lock()
            .values()
            .filter(|m| is_admin || m.user_id == *user_id || m.access == ModelAccess::Public)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &ModelId) -> Result<ModelDeleteOutcome, RepoError> {
        if self
            .dependencies
            .lock()
            .iter()
            .any(|(_, dependency)| *dependency == id.0)
        {
            return Ok(ModelDeleteOutcome::HasDependents);
        }
        let removed = self.models.lock().remove(&id.0);
        match removed {
            Some(model) => {
                self.dependencies.lock().retain(|(from, _)| *from != id.0);
                self.attributes
                    .lock()
                    .retain(|(model_id, _), _| *model_id != id.0);
                Ok(ModelDeleteOutcome::Deleted(Box::new(model)))
            }
            None => Ok(ModelDeleteOutcome::NotFound),
        }
    }

    async fn models_of_user(&self, user_id: &UserId) -> Result<Vec<Model>, RepoError> {
        Ok(self
            .models
            .lock()
            .values()
            .filter(|m| m.user_id == *user_id)
            .cloned()
            .collect())
    }

    async fn set_access(&self, id: &ModelId, access: ModelAccess) -> Result<bool, RepoError> {
        Ok(self
            .models
            .lock()
            .get_mut(&id.0)
            .map(|m| m.access = access)
            .is_some())
    }

    async fn set_default_permission(
        &self,
        id: &ModelId,
        default_permission: DefaultPermission,
    ) -> Result<bool, RepoError> {
        Ok(self
            .models
            .lock()
            .get_mut(&id.0)
            .map(|m| m.default_permission = default_permission)
            .is_some())
    }

    async fn set_team(&self, id: &ModelId, team_id: Option<TeamId>) -> Result<bool, RepoError> {
        Ok(self
            .models
            .lock()
            .get_mut(&id.0)
            .map(|m| {
                m.team_id = team_id;
                if team_id.is_none() && m.access == ModelAccess::Protected {
                    m.access = ModelAccess::Private;
                }
            })
            .is_some())
    }

    async fn set_deployment_name(&self, id: &ModelId, name: &str) -> Result<bool, RepoError> {
        let mut models = self.models.lock();
        if models
            .values()
            .any(|m| m.id.0 != id.0 && m.deployment_name.as_deref() == Some(name))
        {
            return Err(unique_violation("models_deployment_name_unique"));
        }
        Ok(models
            .get_mut(&id.0)
            .map(|m| m.deployment_name = Some(name.to_string()))
            .is_some())
    }

    async fn transition_train(
        &self,
        id: &ModelId,
        next: TrainStatus,
    ) -> Result<TransitionOutcome<TrainStatus>, RepoError> {
        let mut models = self.models.lock();
        let Some(model) = models.get_mut(&id.0) else {
            return Ok(TransitionOutcome::NotFound);
        };
        let current = model.train_status;
        if current == next {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !current.may_transition(next) {
            return Ok(TransitionOutcome::Refused { current });
        }
        model.train_status = next;
        Ok(TransitionOutcome::Applied { from: current })
    }

    async fn transition_deploy(
        &self,
        id: &ModelId,
        next: DeployStatus,
    ) -> Result<TransitionOutcome<DeployStatus>, RepoError> {
        let mut models = self.models.lock();
        let Some(model) = models.get_mut(&id.0) else {
            return Ok(TransitionOutcome::NotFound);
        };
        let current = model.deploy_status;
        if current == next {
            return Ok(TransitionOutcome::Unchanged);
        }
        if !current.may_transition(next) {
            return Ok(TransitionOutcome::Refused { current });
        }
        model.deploy_status = next;
        Ok(TransitionOutcome::Applied { from: current })
    }

    async fn add_dependency(
        &self,
        model_id: &ModelId,
        dependency_id: &ModelId,
    ) -> Result<AddDependencyOutcome, RepoError> {
        {
            let models = self.models.lock();
            if !models.contains_key(&model_id.0) || !models.contains_key(&dependency_id.0) {
                return Ok(AddDependencyOutcome::NotFound);
            }
        }
        if model_id == dependency_id
            || self.reachable_from(dependency_id.0).contains(&model_id.0)
        {
            return Ok(AddDependencyOutcome::WouldCycle);
        }
        self.dependencies
            .lock()
            .insert((model_id.0, dependency_id.0));
        Ok(AddDependencyOutcome::Added)
    }

    async fn dependencies_of(&self, id: &ModelId) -> Result<Vec<Model>, RepoError> {
        let dependency_ids: Vec<Uuid> = self
            .dependencies
            .lock()
            .iter()
            .filter(|(from, _)| *from == id.0)
            .map(|(_, to)| *to)
            .collect();
        let models = self.models.lock();
        Ok(dependency_ids
            .into_iter()
            .filter_map(|dependency| models.get(&dependency).cloned())
            .collect())
    }

    async fn upsert_attribute(
        &self,
        id: &ModelId,
        key: &str,
        value: &str,
    ) -> Result<(), RepoError> {
        self.attributes
            .lock()
            .insert((id.0, key.to_string()), value.to_string());
        Ok(())
    }

    async fn attributes(&self, id: &ModelId) -> Result<BTreeMap<String, String>, RepoError> {
        Ok(self
            .attributes
            .lock()
            .iter()
            .filter(|((model_id, _), _)| *model_id == id.0)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn append_job_log(
        &self,
        id: &ModelId,
        level: JobLogLevel,
        message: &str,
    ) -> Result<(), RepoError> {
        self.logs.lock().push(JobLogEntry {
            model_id: *id,
            level,
            logged_at: Utc::now(),
            message: message.to_string(),
        });
        Ok(())
    }

    async fn job_logs(&self, id: &ModelId) -> Result<Vec<JobLogEntry>, RepoError> {
        Ok(self
            .logs
            .lock()
            .iter()
            .filter(|entry| entry.model_id == *id)
            .cloned()
            .collect())
    }

    async fn non_terminal(&self) -> Result<Vec<Model>, RepoError> {
        Ok(self
            .models
            .lock()
            .values()
            .filter(|m| {
                matches!(
                    m.train_status,
                    TrainStatus::Starting | TrainStatus::InProgress
                ) || !m.deploy_status.is_settled()
            })
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryUserRepo {
    pub users: Mutex<HashMap<Uuid, User>>,
}

impl InMemoryUserRepo {
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        let repo = Self::default();
        {
            let mut map = repo.users.lock();
            for user in users {
                map.insert(user.id.0, user);
            }
        }
        repo
    }
}

#[async_trait]
impl UserRepo for InMemoryUserRepo {
    async fn create(&self, user: &User) -> Result<(), RepoError> {
        let mut users = self.users.lock();
        if users
            .values()
            .any(|u| u.username == user.username || u.email == user.email)
        {
            return Err(unique_violation("users_username_unique"));
        }
        users.insert(user.id.0, user.clone());
        Ok(())
    }

    async fn get(&self, id: &UserId) -> Result<Option<User>, RepoError> {
        Ok(self.users.lock().get(&id.0).cloned())
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>, RepoError> {
        Ok(self
            .users
            .lock()
            .values()
            .find(|u| u.username == username)
            .cloned())
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>, RepoError> {
        Ok(self
            .users
            .lock()
            .values()
            .find(|u| u.email == email)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<User>, RepoError> {
        Ok(self.users.lock().values().cloned().collect())
    }

    async fn delete(&self, id: &UserId) -> Result<UserDeleteOutcome, RepoError> {
        let mut users = self.users.lock();
        let Some(target) = users.get(&id.0) else {
            return Ok(UserDeleteOutcome::NotFound);
        };
        if target.is_admin && users.values().filter(|u| u.is_admin).count() <= 1 {
            return Ok(UserDeleteOutcome::LastAdmin);
        }
        users.remove(&id.0);
        Ok(UserDeleteOutcome::Deleted)
    }

    async fn set_admin(&self, id: &UserId, is_admin: bool) -> Result<AdminFlagOutcome, RepoError> {
        let mut users = self.users.lock();
        let Some(target) = users.get(&id.0) else {
            return Ok(AdminFlagOutcome::NotFound);
        };
        if target.is_admin
            && !is_admin
            && users.values().filter(|u| u.is_admin).count() <= 1
        {
            return Ok(AdminFlagOutcome::LastAdmin);
        }
        if let Some(user) = users.get_mut(&id.0) {
            user.is_admin = is_admin;
        }
        Ok(AdminFlagOutcome::Updated)
    }

    async fn set_verified(&self, id: &UserId, is_verified: bool) -> Result<bool, RepoError> {
        Ok(self
            .users
            .lock()
            .get_mut(&id.0)
            .map(|u| u.is_verified = is_verified)
            .is_some())
    }
}

#[derive(Default)]
pub struct InMemoryTeamRepo {
    pub teams: Mutex<HashMap<Uuid, Team>>,
    pub memberships: Mutex<HashMap<(Uuid, Uuid), bool>>,
}

#[async_trait]
impl TeamRepo for InMemoryTeamRepo {
    async fn create(&self, team: &Team) -> Result<(), RepoError> {
        let mut teams = self.teams.lock();
        if teams.values().any(|t| t.name == team.name) {
            return Err(unique_violation("teams_name_unique"));
        }
        teams.insert(team.id.0, team.clone());
        Ok(())
    }

    async fn get(&self, id: &TeamId) -> Result<Option<Team>, RepoError> {
        Ok(self.teams.lock().get(&id.0).cloned())
    }

    async fn list(&self) -> Result<Vec<Team>, RepoError> {
        Ok(self.teams.lock().values().cloned().collect())
    }

    async fn delete(&self, id: &TeamId) -> Result<bool, RepoError> {
        Ok(self.teams.lock().remove(&id.0).is_some())
    }

    async fn add_member(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<(), RepoError> {
        self.memberships
            .lock()
            .insert((team_id.0, user_id.0), is_team_admin);
        Ok(())
    }

    async fn remove_member(&self, team_id: &TeamId, user_id: &UserId) -> Result<bool, RepoError> {
        Ok(self
            .memberships
            .lock()
            .remove(&(team_id.0, user_id.0))
            .is_some())
    }

    async fn set_team_admin(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<bool, RepoError> {
        let mut memberships = self.memberships.lock();
        match memberships.get_mut(&(team_id.0, user_id.0)) {
            Some(flag) => {
                *flag = is_team_admin;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_membership(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
    ) -> Result<Option<TeamMember>, RepoError> {
        Ok(self
            .memberships
            .lock()
            .get(&(team_id.0, user_id.0))
            .map(|is_team_admin| TeamMember {
                user_id: *user_id,
                team_id: *team_id,
                is_team_admin: *is_team_admin,
            }))
    }

    async fn members(&self, team_id: &TeamId) -> Result<Vec<TeamMember>, RepoError> {
        Ok(self
            .memberships
            .lock()
            .iter()
            .filter(|((team, _), _)| *team == team_id.0)
            .map(|((team, user), is_team_admin)| TeamMember {
                user_id: UserId(*user),
                team_id: TeamId(*team),
                is_team_admin: *is_team_admin,
            })
            .collect())
    }

    async fn teams_of_user(&self, user_id: &UserId) -> Result<Vec<TeamMember>, RepoError> {
        Ok(self
            .memberships
            .lock()
            .iter()
            .filter(|((_, user), _)| *user == user_id.0)
            .map(|((team, user), is_team_admin)| TeamMember {
                user_id: UserId(*user),
                team_id: TeamId(*team),
                is_team_admin: *is_team_admin,
            })
            .collect())
    }
}

#[derive(Default)]
pub struct InMemoryApiKeyRepo {
    pub keys: Mutex<HashMap<Uuid, ApiKeyRecord>>,
    pub key_models: Mutex<HashMap<Uuid, Vec<ModelId>>>,
}

#[async_trait]
impl ApiKeyRepo for InMemoryApiKeyRepo {
    async fn create(
        &self,
        record: &ApiKeyRecord,
        model_ids: &[ModelId],
    ) -> Result<(), RepoError> {
        self.keys.lock().insert(record.id, record.clone());
        self.key_models.lock().insert(record.id, model_ids.to_vec());
        Ok(())
    }

    async fn get(
        &self,
        id: &bazaar_common::model::ApiKeyId,
    ) -> Result<Option<ApiKeyRecord>, RepoError> {
        Ok(self.keys.lock().get(&id.0).cloned())
    }

    async fn models_of(
        &self,
        id: &bazaar_common::model::ApiKeyId,
    ) -> Result<Vec<ModelId>, RepoError> {
        Ok(self.key_models.lock().get(&id.0).cloned().unwrap_or_default())
    }

    async fn list_of_owner(&self, user_id: &UserId) -> Result<Vec<ApiKey>, RepoError> {
        Ok(self
            .keys
            .lock()
            .values()
            .filter(|record| record.user_id == user_id.0)
            .cloned()
            .map(ApiKey::from)
            .collect())
    }

    async fn delete(
        &self,
        id: &bazaar_common::model::ApiKeyId,
        owner: &UserId,
    ) -> Result<bool, RepoError> {
        let mut keys = self.keys.lock();
        match keys.get(&id.0) {
            Some(record) if record.user_id == owner.0 => {
                keys.remove(&id.0);
                self.key_models.lock().remove(&id.0);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryUploadRepo {
    pub sessions: Mutex<HashMap<Uuid, UploadSession>>,
}

#[async_trait]
impl UploadRepo for InMemoryUploadRepo {
    async fn create(&self, session: &UploadSession) -> Result<(), RepoError> {
        self.sessions.lock().insert(session.id.0, session.clone());
        Ok(())
    }

    async fn get(
        &self,
        id: &bazaar_common::model::UploadId,
    ) -> Result<Option<UploadSession>, RepoError> {
        Ok(self.sessions.lock().get(&id.0).cloned())
    }

    async fn delete(&self, id: &bazaar_common::model::UploadId) -> Result<bool, RepoError> {
        Ok(self.sessions.lock().remove(&id.0).is_some())
    }

    async fn created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>, RepoError> {
        Ok(self
            .sessions
            .lock()
            .values()
            .filter(|session| session.created_at < cutoff)
            .cloned()
            .collect())
    }
}
