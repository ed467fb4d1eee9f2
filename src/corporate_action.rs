use crate::contract::parse_instrument_code;
use crate::models::CorporateAction;
use anyhow::{anyhow, Context, Result};
use log::info;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Ex-dividend/rights events per instrument, sorted by registration date.
/// Shared read-only across runs.
#[derive(Debug, Clone, Default)]
pub struct CorporateActionBook {
    actions: HashMap<String, Vec<CorporateAction>>,
}

impl CorporateActionBook {
    pub fn new(actions: Vec<CorporateAction>) -> Result<Self> {
        let mut grouped: HashMap<String, Vec<CorporateAction>> = HashMap::new();
        for mut action in actions {
            let (inst_id, _) = parse_instrument_code(&action.inst_id)
                .with_context(|| format!("Invalid corporate action for {}", action.inst_id))?;
            if action.registration_date > action.ex_date {
                return Err(anyhow!(
                    "Corporate action for {} registers on {} after its ex-date {}",
                    inst_id,
                    action.registration_date,
                    action.ex_date
                ));
            }
            if action.is_share_exchange() {
                let target = action.exchange_target.as_deref().unwrap_or_default();
                let (target, _) = parse_instrument_code(target).with_context(|| {
                    format!("Invalid share exchange target for {}", inst_id)
                })?;
                action.exchange_target = Some(target);
            }
            for (label, value) in [
                ("cash dividend", action.cash_dividend),
                ("stock dividend ratio", action.stock_dividend_ratio),
                ("rights ratio", action.rights_ratio),
                ("rights price", action.rights_price),
                ("exchange ratio", action.exchange_ratio),
            ] {
                if !value.is_finite() || value < 0.0 {
                    return Err(anyhow!(
                        "Corporate action for {} on {} has invalid {} {}",
                        inst_id,
                        action.registration_date,
                        label,
                        value
                    ));
                }
            }
            action.inst_id = inst_id.clone();
            grouped.entry(inst_id).or_default().push(action);
        }

        for events in grouped.values_mut() {
            events.sort_by(|a, b| a.registration_date.cmp(&b.registration_date));
        }

        Ok(Self { actions: grouped })
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read corporate actions from {}", path.display()))?;
        let actions: Vec<CorporateAction> = serde_json::from_str(&raw)
            .with_context(|| format!("Malformed corporate action file {}", path.display()))?;
        let book = Self::new(actions)?;
        info!(
            "Loaded {} corporate action(s) for {} instrument(s) from {}",
            book.len(),
            book.actions.len(),
            path.display()
        );
        Ok(book)
    }

    pub fn for_instrument(&self, inst_id: &str) -> &[CorporateAction] {
        self.actions
            .get(inst_id)
            .map(|events| events.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.actions.values().map(|events| events.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn event(inst: &str, reg_day: u32) -> CorporateAction {
        CorporateAction {
            inst_id: inst.to_string(),
            ex_date: NaiveDate::from_ymd_opt(2021, 7, reg_day + 1).unwrap(),
            registration_date: NaiveDate::from_ymd_opt(2021, 7, reg_day).unwrap(),
            close_price: 10.0,
            cash_dividend: 0.3,
            stock_dividend_ratio: 0.0,
            rights_ratio: 0.0,
            rights_price: 0.0,
            exchange_ratio: 0.0,
            exchange_target: None,
            ex_price: None,
        }
    }

    #[test]
    fn groups_and_sorts_by_registration_date() {
        let book = CorporateActionBook::new(vec![
            event("600000.sh", 20),
            event("600000.SH", 3),
            event("000001.SZ", 9),
        ])
        .unwrap();
        let events = book.for_instrument("600000.SH");
        assert_eq!(events.len(), 2);
        assert!(events[0].registration_date < events[1].registration_date);
        assert_eq!(book.len(), 3);
        assert!(book.for_instrument("601000.SH").is_empty());
    }

    #[test]
    fn rejects_unknown_codes_and_negative_values() {
        assert!(CorporateActionBook::new(vec![event("AAPL", 1)]).is_err());
        let mut negative = event("600000.SH", 1);
        negative.cash_dividend = -1.0;
        assert!(CorporateActionBook::new(vec![negative]).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = std::env::temp_dir().join(format!(
            "corporate-actions-{}.json",
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, "{ not json").unwrap();
        let result = CorporateActionBook::load_from_file(&path);
        let _ = fs::remove_file(&path);
        assert!(result.is_err());
    }

    #[test]
    fn loads_json_with_defaulted_fields() {
        let path = std::env::temp_dir().join(format!(
            "corporate-actions-{}.json",
            uuid::Uuid::new_v4()
        ));
        fs::write(
            &path,
            r#"[{"inst_id":"600000.SH","ex_date":"2021-07-02","registration_date":"2021-07-01","cash_dividend":0.25}]"#,
        )
        .unwrap();
        let result = CorporateActionBook::load_from_file(&path);
        let _ = fs::remove_file(&path);
        let book = result.unwrap();
        assert_eq!(book.for_instrument("600000.SH")[0].cash_dividend, 0.25);
    }
}
