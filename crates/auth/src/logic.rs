//! Attribution and tenancy strategies the store consults on every create and
//! query. Both receive the subject of the call, if any.

use crate::Subject;

/// Determines the creator names stamped on objects at create time.
pub trait AttributionLogic: Send + Sync {
    fn determine_assigned_creators(&self, subject: Option<&Subject>) -> Vec<String>;
}

/// Determines the tenants stamped on created objects and the tenants the
/// caller is allowed to see. An empty visible set disables tenant filtering
/// entirely, which is what the empty logic relies on.
pub trait TenancyLogic: Send + Sync {
    fn determine_assigned_tenants(&self, subject: Option<&Subject>) -> Vec<String>;
    fn determine_visible_tenants(&self, subject: Option<&Subject>) -> Vec<String>;
}

/// Attributes created objects to the calling subject. A missing subject is a
/// programming error: every non-public path attaches one before the store
/// runs.
#[derive(Debug, Default)]
pub struct DefaultAttributionLogic;

impl AttributionLogic for DefaultAttributionLogic {
    fn determine_assigned_creators(&self, subject: Option<&Subject>) -> Vec<String> {
        let subject = subject.expect("subject is missing from the call context");
        vec![subject.user.clone()]
    }
}

/// Records no creators.
#[derive(Debug, Default)]
pub struct EmptyAttributionLogic;

impl AttributionLogic for EmptyAttributionLogic {
    fn determine_assigned_creators(&self, _subject: Option<&Subject>) -> Vec<String> {
        Vec::new()
    }
}

// TODO: derive the tenant set from the subject groups once group-to-tenant
// mapping is defined. Until then every object lands in the shared tenant.
const DEFAULT_TENANTS: &[&str] = &["shared"];

#[derive(Debug, Default)]
pub struct DefaultTenancyLogic;

impl TenancyLogic for DefaultTenancyLogic {
    fn determine_assigned_tenants(&self, _subject: Option<&Subject>) -> Vec<String> {
        DEFAULT_TENANTS.iter().map(|t| t.to_string()).collect()
    }

    fn determine_visible_tenants(&self, _subject: Option<&Subject>) -> Vec<String> {
        DEFAULT_TENANTS.iter().map(|t| t.to_string()).collect()
    }
}

/// Returns no tenants at all. The empty visible set makes the store skip
/// tenant filtering, so this is the permissive fallback.
#[derive(Debug, Default)]
pub struct EmptyTenancyLogic;

impl TenancyLogic for EmptyTenancyLogic {
    fn determine_assigned_tenants(&self, _subject: Option<&Subject>) -> Vec<String> {
        Vec::new()
    }

    fn determine_visible_tenants(&self, _subject: Option<&Subject>) -> Vec<String> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_attribution_echoes_the_subject_user() {
        let subject = Subject::new("jane.doe", vec!["admins".to_string()]);
        let creators = DefaultAttributionLogic.determine_assigned_creators(Some(&subject));
        assert_eq!(creators, vec!["jane.doe".to_string()]);
    }

    #[test]
    #[should_panic(expected = "subject is missing")]
    fn default_attribution_panics_without_subject() {
        DefaultAttributionLogic.determine_assigned_creators(None);
    }

    #[test]
    fn empty_attribution_returns_no_creators() {
        let subject = Subject::new("jane.doe", Vec::new());
        assert!(EmptyAttributionLogic
            .determine_assigned_creators(Some(&subject))
            .is_empty());
        assert!(EmptyAttributionLogic
            .determine_assigned_creators(None)
            .is_empty());
    }

    #[test]
    fn default_tenancy_uses_the_shared_tenant() {
        let assigned = DefaultTenancyLogic.determine_assigned_tenants(None);
        let visible = DefaultTenancyLogic.determine_visible_tenants(None);
        assert_eq!(assigned, vec!["shared".to_string()]);
        assert_eq!(visible, assigned);
    }

    #[test]
    fn empty_tenancy_returns_nothing() {
        assert!(EmptyTenancyLogic.determine_assigned_tenants(None).is_empty());
        assert!(EmptyTenancyLogic.determine_visible_tenants(None).is_empty());
    }
}
