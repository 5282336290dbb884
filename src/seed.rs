use crate::engine::{EngineError, Scheduler};
use crate::model::*;

/// Sample catalog for a fresh installation.
const SAMPLE_VENUES: [(&str, u32, &str); 5] = [
    ("Main Auditorium", 200, "Auditorium"),
    ("Seminar Hall A", 50, "Seminar"),
    ("Computer Lab 3", 30, "Lab"),
    ("Conference Room", 25, "Conference"),
    ("Sports Complex", 100, "Sports"),
];

/// Register `admins` with the admin role. Existing records keep their name
/// and email.
pub async fn bootstrap_admins(scheduler: &Scheduler, admins: &[String]) -> Result<usize, EngineError> {
    for id in admins {
        let existing = match scheduler.get_user(id).await {
            Ok(user) => Some(user),
            Err(EngineError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        if existing.as_ref().is_some_and(User::is_admin) {
            continue;
        }
        let user = match existing {
            Some(user) => User {
                role: Role::Admin,
                ..user
            },
            None => User {
                id: id.clone(),
                name: id.clone(),
                email: None,
                role: Role::Admin,
            },
        };
        scheduler.save_user(user).await?;
    }
    Ok(admins.len())
}

/// Add the sample venues when the catalog is empty. Returns how many were added.
pub async fn seed_venues(scheduler: &Scheduler) -> Result<usize, EngineError> {
    if !scheduler.list_venues().await?.is_empty() {
        return Ok(0);
    }
    for (name, capacity, tag) in SAMPLE_VENUES {
        scheduler
            .save_venue(VenueDraft {
                id: None,
                name: name.to_string(),
                capacity,
                image_url: Some(format!("https://via.placeholder.com/60x60?text={tag}")),
            })
            .await?;
    }
    tracing::info!("seeded {} sample venues", SAMPLE_VENUES.len());
    Ok(SAMPLE_VENUES.len())
}
