use chrono::{Datelike, NaiveDate};

use crate::models::report::{PayrollTotals, Payslip};

/// Payroll parameters. Rates are in basis points (1 % = 100).
#[derive(Debug, Clone)]
pub struct PayrollRules {
    pub seniority_bp_per_year: i64,
    pub transport_allowance: i64,
    pub cnss_employee_bp: i64,
    pub cnss_employer_bp: i64,
    pub income_tax_threshold: i64,
    pub income_tax_bp: i64,
}

impl Default for PayrollRules {
    fn default() -> Self {
        Self {
            seniority_bp_per_year: 200,
            transport_allowance: 15_000,
            cnss_employee_bp: 350,
            cnss_employer_bp: 650,
            income_tax_threshold: 100_000,
            income_tax_bp: 1_000,
        }
    }
}

impl PayrollRules {
    /// Function bonus as a share of the base salary.
    pub fn function_bonus_bp(&self, fonction: &str) -> i64 {
        match fonction {
            "directeur" => 3_000,
            "censeur" => 2_000,
            "comptable" | "surveillant" => 1_500,
            "enseignant" => 1_000,
            _ => 0,
        }
    }
}

/// `amount * bp / 10000`, rounded half up.
fn percent(amount: i64, bp: i64) -> i64 {
    (amount * bp + 5_000) / 10_000
}

/// Full years of service at `on`.
pub fn years_of_service(hired: NaiveDate, on: NaiveDate) -> i64 {
    if on < hired {
        return 0;
    }
    let mut years = (on.year() - hired.year()) as i64;
    if (on.month(), on.day()) < (hired.month(), hired.day()) {
        years -= 1;
    }
    years.max(0)
}

/// Last day of the given month.
pub fn month_end(annee: i32, mois: u32) -> Option<NaiveDate> {
    let (y, m) = if mois == 12 { (annee + 1, 1) } else { (annee, mois + 1) };
    NaiveDate::from_ymd_opt(y, m, 1)?.pred_opt()
}

pub fn compute_payslip(rules: &PayrollRules, salaire_base: i64, fonction: &str, years: i64) -> Payslip {
    let prime_anciennete = percent(salaire_base, rules.seniority_bp_per_year * years);
    let prime_fonction = percent(salaire_base, rules.function_bonus_bp(fonction));
    let indemnite_transport = rules.transport_allowance;
    let salaire_brut = salaire_base + prime_anciennete + prime_fonction + indemnite_transport;

    let cnss_salarie = percent(salaire_brut, rules.cnss_employee_bp);
    let cnss_patronal = percent(salaire_brut, rules.cnss_employer_bp);
    let base_imposable = salaire_brut - cnss_salarie;
    let impot = if base_imposable > rules.income_tax_threshold {
        percent(base_imposable - rules.income_tax_threshold, rules.income_tax_bp)
    } else {
        0
    };

    Payslip {
        salaire_base,
        annees_anciennete: years,
        prime_anciennete,
        prime_fonction,
        indemnite_transport,
        salaire_brut,
        cnss_salarie,
        cnss_patronal,
        base_imposable,
        impot,
        salaire_net: salaire_brut - cnss_salarie - impot,
        cout_employeur: salaire_brut + cnss_patronal,
    }
}

pub fn totals<'a>(slips: impl IntoIterator<Item = &'a Payslip>) -> PayrollTotals {
    slips.into_iter().fold(PayrollTotals::default(), |mut t, p| {
        t.salaire_brut += p.salaire_brut;
        t.cnss_salarie += p.cnss_salarie;
        t.cnss_patronal += p.cnss_patronal;
        t.impot += p.impot;
        t.salaire_net += p.salaire_net;
        t.cout_employeur += p.cout_employeur;
        t
    })
}
