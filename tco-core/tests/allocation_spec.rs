use speculate2::speculate;
use tco_core::*;
use uuid::Uuid;

fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-6 * b.abs().max(1.0)
}

fn team_x() -> TeamCostProfile {
    TeamCostProfile {
        team_id: Uuid::new_v4(),
        team_name: "Team X".to_string(),
        program_id: None,
        team_fte: 4.0,
        delivery_fte: 2.0,
        contractor_cs_fte: 1.0,
        contractor_c_fte: 1.0,
        xom_rate: 100_000.0,
        contractor_cs_rate: 80_000.0,
        contractor_c_rate: 70_000.0,
    }
}

fn feature(id: &str, team: &str, effort: Option<f64>, iteration: &str) -> FeatureRecord {
    FeatureRecord {
        team_raw: Some(team.to_string()),
        effort_points: effort,
        iteration_path: Some(iteration.to_string()),
        ado_year: Some(2025),
        ..FeatureRecord::new(id)
    }
}

speculate! {
    before {
        let team = team_x();
        let mappings = LabelMappings::default().with_team("X", team.team_id);
    }

    describe "worked example" {
        it "allocates fixed cost by effort and prices each role" {
            let features = vec![
                feature("A", "X", Some(3.0), "I1"),
                feature("B", "X", Some(1.0), "I1"),
            ];
            let report = allocate(&[team.clone()], &features, &mappings, AllocationPolicy::Proportional);

            let a = report.feature("A").expect("A allocated");
            let b = report.feature("B").expect("B allocated");

            assert!(approx_eq(a.team_cost_per_pi.unwrap(), 75_000.0));
            assert!(approx_eq(b.team_cost_per_pi.unwrap(), 25_000.0));

            assert!(approx_eq(a.delivery_cost_per_pi, 150_000.0));
            assert!(approx_eq(a.contractor_cs_cost_per_pi, 60_000.0));
            assert!(approx_eq(a.contractor_c_cost_per_pi, 52_500.0));

            assert!(approx_eq(b.delivery_cost_per_pi, 50_000.0));
            assert!(approx_eq(b.contractor_cs_cost_per_pi, 20_000.0));
            assert!(approx_eq(b.contractor_c_cost_per_pi, 17_500.0));

            assert_eq!(a.pi_key.as_deref(), Some("2025-I1"));

            let cohort = report
                .cohort(team.team_id, PeriodKey::new(2025, 1))
                .expect("cohort exists");
            assert_eq!(cohort.feature_count, 2);
            assert!(approx_eq(cohort.fixed_period_cost, 100_000.0));
            assert!(approx_eq(cohort.total_effort_points, 4.0));
        }
    }

    describe "conservation" {
        it "sums cohort shares back to the fixed cost" {
            let efforts = [Some(0.5), Some(13.0), None, Some(2.25), Some(8.0), Some(1.0), Some(0.0)];
            let features: Vec<FeatureRecord> = efforts
                .iter()
                .enumerate()
                .map(|(i, e)| feature(&i.to_string(), "X", *e, "Iteration 2"))
                .collect();

            for policy in [AllocationPolicy::Proportional, AllocationPolicy::Even] {
                let report = allocate(&[team.clone()], &features, &mappings, policy);
                let total: f64 = report
                    .features
                    .iter()
                    .filter_map(|f| f.team_cost_per_pi)
                    .sum();
                assert!(approx_eq(total, fixed_period_cost(&team)));

                let cohort = &report.cohorts[0];
                assert!(approx_eq(cohort.allocated_fixed_cost, cohort.fixed_period_cost));
            }
        }

        it "keeps cohorts of different periods apart" {
            let features = vec![
                feature("1", "X", Some(1.0), "I1"),
                feature("2", "X", Some(5.0), "I2"),
                feature("3", "X", Some(5.0), "I2"),
            ];
            let report = allocate(&[team.clone()], &features, &mappings, AllocationPolicy::Proportional);

            assert_eq!(report.cohorts.len(), 2);
            assert!(approx_eq(report.feature("1").unwrap().team_cost_per_pi.unwrap(), 100_000.0));
            assert!(approx_eq(report.feature("2").unwrap().team_cost_per_pi.unwrap(), 50_000.0));
        }
    }

    describe "zero fixed cost" {
        it "gives every feature a zero share when team_fte is zero" {
            let mut idle = team.clone();
            idle.team_fte = 0.0;
            let features = vec![feature("1", "X", Some(2.0), "I1"), feature("2", "X", None, "I1")];
            let report = allocate(&[idle], &features, &mappings, AllocationPolicy::Proportional);
            assert!(report.features.iter().all(|f| f.team_cost_per_pi == Some(0.0)));
        }

        it "gives every feature a zero share when xom_rate is zero" {
            let mut unpriced = team.clone();
            unpriced.xom_rate = 0.0;
            let features = vec![feature("1", "X", Some(2.0), "I1")];
            let report = allocate(&[unpriced], &features, &mappings, AllocationPolicy::Proportional);
            assert_eq!(report.features[0].team_cost_per_pi, Some(0.0));
        }
    }

    describe "proportional monotonicity" {
        it "gives double the share for double the effort" {
            let features = vec![
                feature("small", "X", Some(1.5), "I3"),
                feature("large", "X", Some(3.0), "I3"),
                feature("other", "X", Some(7.0), "I3"),
            ];
            let report = allocate(&[team.clone()], &features, &mappings, AllocationPolicy::Proportional);
            let small = report.feature("small").unwrap().team_cost_per_pi.unwrap();
            let large = report.feature("large").unwrap().team_cost_per_pi.unwrap();
            assert!(approx_eq(large, 2.0 * small));
        }
    }

    describe "even split fallback" {
        it "splits evenly when the cohort has no effort" {
            let features = vec![
                feature("1", "X", None, "I1"),
                feature("2", "X", Some(0.0), "I1"),
                feature("3", "X", None, "I1"),
                feature("4", "X", Some(0.0), "I1"),
            ];
            let report = allocate(&[team.clone()], &features, &mappings, AllocationPolicy::Proportional);
            for f in &report.features {
                assert_eq!(f.team_cost_per_pi, Some(25_000.0));
            }
        }

        it "always splits evenly under the even policy" {
            let features = vec![feature("1", "X", Some(9.0), "I1"), feature("2", "X", Some(1.0), "I1")];
            let report = allocate(&[team.clone()], &features, &mappings, AllocationPolicy::Even);
            assert_eq!(report.policy, AllocationPolicy::Even);
            for f in &report.features {
                assert_eq!(f.team_cost_per_pi, Some(50_000.0));
            }
        }
    }

    describe "role costs" {
        it "are zero when the team has no role FTEs" {
            let mut no_roles = team.clone();
            no_roles.delivery_fte = 0.0;
            no_roles.contractor_cs_fte = 0.0;
            no_roles.contractor_c_fte = 0.0;
            let features = vec![feature("1", "X", Some(40.0), "I1")];
            let report = allocate(&[no_roles], &features, &mappings, AllocationPolicy::Proportional);
            let row = &report.features[0];
            assert_eq!(row.delivery_cost_per_pi, 0.0);
            assert_eq!(row.contractor_cs_cost_per_pi, 0.0);
            assert_eq!(row.contractor_c_cost_per_pi, 0.0);
        }

        it "double when effort doubles" {
            let single = role_costs(&team, Some(2.5));
            let double = role_costs(&team, Some(5.0));
            assert!(approx_eq(double.delivery, 2.0 * single.delivery));
            assert!(approx_eq(double.contractor_cs, 2.0 * single.contractor_cs));
            assert!(approx_eq(double.contractor_c, 2.0 * single.contractor_c));
        }

        it "are still computed for features without a period" {
            let features = vec![feature("1", "X", Some(1.0), "Backlog")];
            let report = allocate(&[team.clone()], &features, &mappings, AllocationPolicy::Proportional);
            let row = &report.features[0];
            assert_eq!(row.team_cost_per_pi, None);
            assert_eq!(row.iteration_num, None);
            assert!(approx_eq(row.delivery_cost_per_pi, 50_000.0));
            assert!(report.cohorts.is_empty());
        }
    }

    describe "unmapped features" {
        it "are excluded from cohorts and listed as diagnostics" {
            let features = vec![
                feature("mapped", "X", Some(1.0), "I1"),
                feature("stray", "Y", Some(100.0), "I1"),
                FeatureRecord { team_raw: None, ..feature("blank", "X", Some(1.0), "I1") },
            ];
            let report = allocate(&[team.clone()], &features, &mappings, AllocationPolicy::Proportional);

            assert_eq!(report.features.len(), 1);
            assert!(report.feature("stray").is_none());
            assert!(approx_eq(report.feature("mapped").unwrap().team_cost_per_pi.unwrap(), 100_000.0));

            assert_eq!(report.unmapped.len(), 2);
            assert_eq!(report.unmapped[0].feature_id, "stray");
            assert_eq!(report.unmapped[0].reason, UnmappedReason::NoMapping);
            assert_eq!(report.unmapped[1].reason, UnmappedReason::MissingTeam);
        }
    }

    describe "period parsing" {
        it "reads iteration numbers from free text" {
            assert_eq!(parse_iteration_number("PI 2025.I3"), Some(3));
            assert_eq!(parse_iteration_number("Iteration  12"), Some(12));
        }

        it "reads fiscal years when no year column is present" {
            assert_eq!(parse_year(None, Some("FY24-Q1"), None, None), Some(2024));
        }

        it "groups a path with an embedded year into that year's cohort" {
            let f = FeatureRecord { ado_year: None, ..feature("1", "X", Some(1.0), "PI 2025.I3") };
            let report = allocate(&[team.clone()], &[f], &mappings, AllocationPolicy::Proportional);
            assert_eq!(report.features[0].pi_key.as_deref(), Some("2025-I3"));
        }
    }

    describe "application groups" {
        it "attach the mapped group to the cost row" {
            let group = Uuid::new_v4();
            let mappings = mappings.clone().with_app("Billing", group);
            let f = FeatureRecord {
                app_name_raw: Some("Billing".to_string()),
                ..feature("1", "X", Some(1.0), "I1")
            };
            let report = allocate(&[team.clone()], &[f], &mappings, AllocationPolicy::Proportional);
            assert_eq!(report.features[0].app_group_id, Some(group));
        }
    }
}
