use crate::limits::*;
use crate::model::*;

use super::error::ValidationError;

/// A request with every required field present.
#[derive(Debug)]
pub(crate) struct CheckedRequest<'a> {
    pub venue_id: ulid::Ulid,
    pub event_name: &'a str,
    pub date: chrono::NaiveDate,
    pub range: TimeRange,
    pub description: Option<&'a str>,
}

/// Required fields first, then the range, then lengths. Missing fields are
/// reported together.
pub(crate) fn check_request<'a>(
    requester_id: &str,
    req: &'a BookingRequest,
) -> Result<CheckedRequest<'a>, ValidationError> {
    let event_name = req.event_name.trim();
    let mut missing = Vec::new();
    if requester_id.trim().is_empty() {
        missing.push("user_id");
    }
    if event_name.is_empty() {
        missing.push("event_name");
    }
    if req.venue_id.is_none() {
        missing.push("venue_id");
    }
    if req.date.is_none() {
        missing.push("date");
    }
    if req.start_time.is_none() {
        missing.push("start_time");
    }
    if req.end_time.is_none() {
        missing.push("end_time");
    }
    let (Some(venue_id), Some(date), Some(start), Some(end)) =
        (req.venue_id, req.date, req.start_time, req.end_time)
    else {
        return Err(ValidationError::MissingFields(missing));
    };
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }

    let range = TimeRange::new(start, end)?;
    check_len("event_name", event_name, MAX_EVENT_NAME_LEN)?;
    let description = req
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());
    if let Some(d) = description {
        check_len("description", d, MAX_DESCRIPTION_LEN)?;
    }

    Ok(CheckedRequest {
        venue_id,
        event_name,
        date,
        range,
        description,
    })
}

pub(crate) fn check_venue(name: &str, capacity: u32, image_url: Option<&str>) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::MissingFields(vec!["name"]));
    }
    check_len("name", name, MAX_NAME_LEN)?;
    if capacity == 0 {
        return Err(ValidationError::InvalidCapacity);
    }
    if let Some(url) = image_url {
        check_len("image_url", url, MAX_URL_LEN)?;
    }
    Ok(())
}

pub(crate) fn check_user(user: &User) -> Result<(), ValidationError> {
    let mut missing = Vec::new();
    if user.id.trim().is_empty() {
        missing.push("id");
    }
    if user.name.trim().is_empty() {
        missing.push("name");
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingFields(missing));
    }
    check_len("id", &user.id, MAX_USER_ID_LEN)?;
    check_len("name", &user.name, MAX_NAME_LEN)?;
    if let Some(email) = &user.email {
        check_len("email", email, MAX_EMAIL_LEN)?;
    }
    Ok(())
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.len() > max {
        return Err(ValidationError::TooLong(field));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_request() -> BookingRequest {
        BookingRequest {
            venue_id: Some(ulid::Ulid::new()),
            event_name: "Guest Lecture".into(),
            date: Some(parse_date("2024-06-01").unwrap()),
            start_time: Some(parse_clock("09:00").unwrap()),
            end_time: Some(parse_clock("10:00").unwrap()),
            description: Some("  ".into()),
        }
    }

    #[test]
    fn complete_request_passes_and_blank_description_is_dropped() {
        let req = full_request();
        let checked = check_request("u1", &req).unwrap();
        assert_eq!(checked.event_name, "Guest Lecture");
        assert_eq!(checked.description, None);
        assert_eq!(checked.range.duration_minutes(), 60);
    }

    #[test]
    fn all_missing_fields_are_named() {
        let req = BookingRequest {
            event_name: "   ".into(),
            ..Default::default()
        };
        let err = check_request("", &req).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingFields(vec![
                "user_id",
                "event_name",
                "venue_id",
                "date",
                "start_time",
                "end_time"
            ])
        );
        assert_eq!(
            err.to_string(),
            "missing required fields: user_id, event_name, venue_id, date, start_time, end_time"
        );
    }

    #[test]
    fn missing_event_name_alone() {
        let req = BookingRequest {
            event_name: String::new(),
            ..full_request()
        };
        assert_eq!(
            check_request("u1", &req).unwrap_err(),
            ValidationError::MissingFields(vec!["event_name"])
        );
    }

    #[test]
    fn equal_start_and_end_is_invalid_range() {
        let req = BookingRequest {
            end_time: Some(parse_clock("09:00").unwrap()),
            ..full_request()
        };
        assert!(matches!(
            check_request("u1", &req),
            Err(ValidationError::InvalidRange(_))
        ));
    }

    #[test]
    fn oversized_fields_rejected() {
        let req = BookingRequest {
            description: Some("x".repeat(MAX_DESCRIPTION_LEN + 1)),
            ..full_request()
        };
        assert_eq!(
            check_request("u1", &req).unwrap_err(),
            ValidationError::TooLong("description")
        );
        assert_eq!(
            check_venue(&"v".repeat(MAX_NAME_LEN + 1), 10, None),
            Err(ValidationError::TooLong("name"))
        );
    }

    #[test]
    fn venue_needs_name_and_capacity() {
        assert!(check_venue("Main Auditorium", 200, None).is_ok());
        assert_eq!(check_venue("Main Auditorium", 0, None), Err(ValidationError::InvalidCapacity));
        assert_eq!(
            check_venue(" ", 5, None),
            Err(ValidationError::MissingFields(vec!["name"]))
        );
    }

    #[test]
    fn user_needs_id_and_name() {
        let user = User {
            id: String::new(),
            name: String::new(),
            email: None,
            role: Role::User,
        };
        assert_eq!(
            check_user(&user),
            Err(ValidationError::MissingFields(vec!["id", "name"]))
        );
    }
}
