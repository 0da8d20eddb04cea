//! C9: privacy policy auditor. Spec §4.9 narrows this considerably against
//! `examples/original_source/server/ppm/ppm.py`, whose `PPM` class also
//! applies differential-privacy noise and performs HE encrypt/decrypt. Those
//! mutating operations are superseded here, not carried forward: PPM's only
//! job is to approve or reject a round's declared privacy mode before the
//! orchestrator invokes SAM. It never touches the updates themselves.

use tracing::warn;

use crate::types::PrivacyMode;

pub struct PrivacyPolicyAuditor {
    he_active: bool,
}

impl PrivacyPolicyAuditor {
    pub fn new(he_active: bool) -> Self {
        Self { he_active }
    }

    /// `Normal` and `Sss` are always approved (`Normal` logs a warning, since
    /// it carries no confidentiality guarantee at all); `He` is approved only
    /// when homomorphic encryption is configured active.
    pub fn verify_audit(&self, mode: PrivacyMode) -> bool {
        match mode {
            PrivacyMode::Normal => {
                warn!("round approved with plaintext (Normal) privacy mode");
                true
            }
            PrivacyMode::Sss => true,
            PrivacyMode::He => self.he_active,
        }
    }

    pub fn recommend_homomorphic(&self) -> bool {
        self.he_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_and_sss_always_pass() {
        let ppm = PrivacyPolicyAuditor::new(false);
        assert!(ppm.verify_audit(PrivacyMode::Normal));
        assert!(ppm.verify_audit(PrivacyMode::Sss));
    }

    #[test]
    fn he_requires_active_configuration() {
        let inactive = PrivacyPolicyAuditor::new(false);
        assert!(!inactive.verify_audit(PrivacyMode::He));
        let active = PrivacyPolicyAuditor::new(true);
        assert!(active.verify_audit(PrivacyMode::He));
    }

    #[test]
    fn recommend_homomorphic_mirrors_he_active() {
        assert!(!PrivacyPolicyAuditor::new(false).recommend_homomorphic());
        assert!(PrivacyPolicyAuditor::new(true).recommend_homomorphic());
    }
}
