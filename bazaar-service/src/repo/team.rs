use super::RepoError;
use crate::model::{Team, TeamMember};
use async_trait::async_trait;
use bazaar_common::model::{TeamId, UserId};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct TeamRecord {
    pub id: Uuid,
    pub name: String,
}

impl From<TeamRecord> for Team {
    fn from(record: TeamRecord) -> Self {
        Team {
            id: TeamId(record.id),
            name: record.name,
        }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct UserTeamRecord {
    pub user_id: Uuid,
    pub team_id: Uuid,
    pub is_team_admin: bool,
}

impl From<UserTeamRecord> for TeamMember {
    fn from(record: UserTeamRecord) -> Self {
        TeamMember {
            user_id: UserId(record.user_id),
            team_id: TeamId(record.team_id),
            is_team_admin: record.is_team_admin,
        }
    }
}

#[async_trait]
pub trait TeamRepo: Send + Sync {
    async fn create(&self, team: &Team) -> Result<(), RepoError>;

    async fn get(&self, id: &TeamId) -> Result<Option<Team>, RepoError>;

    async fn list(&self) -> Result<Vec<Team>, RepoError>;

    async fn delete(&self, id: &TeamId) -> Result<bool, RepoError>;

    /// Insert-or-update of the membership row.
    async fn add_member(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<(), RepoError>;

    async fn remove_member(&self, team_id: &TeamId, user_id: &UserId) -> Result<bool, RepoError>;

    async fn set_team_admin(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<bool, RepoError>;

    async fn get_membership(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
    ) -> Result<Option<TeamMember>, RepoError>;

    async fn members(&self, team_id: &TeamId) -> Result<Vec<TeamMember>, RepoError>;

    async fn teams_of_user(&self, user_id: &UserId) -> Result<Vec<TeamMember>, RepoError>;
}

pub struct DbTeamRepo {
    db_pool: PgPool,
}

impl DbTeamRepo {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TeamRepo for DbTeamRepo {
    async fn create(&self, team: &Team) -> Result<(), RepoError> {
        sqlx::query("INSERT INTO teams (id, name) VALUES ($1, $2)")
            .bind(team.id.0)
            .bind(&team.name)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(())
    }

    async fn get(&self, id: &TeamId) -> Result<Option<Team>, RepoError> {
        sqlx::query_as::<_, TeamRecord>("SELECT id, name FROM teams WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.db_pool)
            .await
            .map(|record| record.map(Team::from))
            .map_err(RepoError::from)
    }

    async fn list(&self) -> Result<Vec<Team>, RepoError> {
        sqlx::query_as::<_, TeamRecord>("SELECT id, name FROM teams ORDER BY name")
            .fetch_all(&self.db_pool)
            .await
            .map(|records| records.into_iter().map(Team::from).collect())
            .map_err(RepoError::from)
    }

    async fn delete(&self, id: &TeamId) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM teams WHERE id = $1")
            .bind(id.0)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_member(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO user_teams (user_id, team_id, is_team_admin)
              VALUES ($1, $2, $3)
              ON CONFLICT (user_id, team_id) DO UPDATE SET is_team_admin = $3
            "#,
        )
        .bind(user_id.0)
        .bind(team_id.0)
        .bind(is_team_admin)
        .execute(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        Ok(())
    }

    async fn remove_member(&self, team_id: &TeamId, user_id: &UserId) -> Result<bool, RepoError> {
        let result = sqlx::query("DELETE FROM user_teams WHERE user_id = $1 AND team_id = $2")
            .bind(user_id.0)
            .bind(team_id.0)
            .execute(&self.db_pool)
            .await
            .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_team_admin(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
        is_team_admin: bool,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            "UPDATE user_teams SET is_team_admin = $3 WHERE user_id = $1 AND team_id = $2",
        )
        .bind(user_id.0)
        .bind(team_id.0)
        .bind(is_team_admin)
        .execute(&self.db_pool)
        .await
        .map_err(RepoError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_membership(
        &self,
        team_id: &TeamId,
        user_id: &UserId,
    ) -> Result<Option<TeamMember>, RepoError> {
        sqlx::query_as::<_, UserTeamRecord>(
            "SELECT user_id, team_id, is_team_admin FROM user_teams WHERE user_id = $1 AND team_id = $2",
        )
        .bind(user_id.0)
        .bind(team_id.0)
        .fetch_optional(&self.db_pool)
        .await
        .map(|record| record.map(TeamMember::from))
        .map_err(RepoError::from)
    }

    async fn members(&self, team_id: &TeamId) -> Result<Vec<TeamMember>, RepoError> {
        sqlx::query_as::<_, UserTeamRecord>(
            "SELECT user_id, team_id, is_team_admin FROM user_teams WHERE team_id = $1",
        )
        .bind(team_id.0)
        .fetch_all(&self.db_pool)
        .await
        .map(|records| records.into_iter().map(TeamMember::from).collect())
        .map_err(RepoError::from)
    }

    async fn teams_of_user(&self, user_id: &UserId) -> Result<Vec<TeamMember>, RepoError> {
        sqlx::query_as::<_, UserTeamRecord>(
            "SELECT user_id, team_id, is_team_admin FROM user_teams WHERE user_id = $1",
        )
        .bind(user_id.0)
        .fetch_all(&self.db_pool)
        .await
        .map(|records| records.into_iter().map(TeamMember::from).collect())
        .map_err(RepoError::from)
    }
}
