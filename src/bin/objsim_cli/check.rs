use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;

use objsim::class_file;
use objsim::input::read_patch_records;

use super::{print_json, ProjectArgs};

#[derive(Parser, Debug)]
#[command(about = "Validate the configuration, the patch records and their class files")]
pub struct CheckCmd {
    #[command(flatten)]
    project: ProjectArgs,
}

#[derive(Debug, Serialize)]
struct Check {
    name: String,
    passed: bool,
    detail: String,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    build_dir: String,
    input_csv: String,
    output_dir: String,
    records: usize,
    checks: Vec<Check>,
    failed: usize,
}

impl CheckCmd {
    pub async fn execute(&self, json_output: bool) -> Result<()> {
        let config = self.project.load_config()?;
        let build_dir = config.build_dir();
        let input = config.input_csv();
        let mut checks = Vec::new();

        checks.push(Check {
            name: "build_dir".into(),
            passed: build_dir.is_dir(),
            detail: build_dir.display().to_string(),
        });

        let records = match read_patch_records(&input, &config.base_dir) {
            Ok(records) => {
                checks.push(Check {
                    name: "input".into(),
                    passed: true,
                    detail: format!("{} records", records.len()),
                });
                records
            }
            Err(e) => {
                checks.push(Check {
                    name: "input".into(),
                    passed: false,
                    detail: format!("{:#}", e),
                });
                Vec::new()
            }
        };

        for record in &records {
            for file in &record.class_files {
                let name = format!("patch {}: {}", record.id, file.display());
                let check = match std::fs::read(file)
                    .map_err(anyhow::Error::from)
                    .and_then(|bytes| class_file::class_name(&bytes))
                {
                    Ok(class) => {
                        let installed = class_file::installed_path(&build_dir, &class);
                        Check {
                            name,
                            passed: installed.is_file(),
                            detail: if installed.is_file() {
                                format!("replaces {}", class)
                            } else {
                                format!("{} is not installed at {}", class, installed.display())
                            },
                        }
                    }
                    Err(e) => Check {
                        name,
                        passed: false,
                        detail: format!("{:#}", e),
                    },
                };
                checks.push(check);
            }
        }

        let failed = checks.iter().filter(|c| !c.passed).count();
        let report = CheckReport {
            build_dir: build_dir.display().to_string(),
            input_csv: input.display().to_string(),
            output_dir: config.output_dir().display().to_string(),
            records: records.len(),
            checks,
            failed,
        };

        if json_output {
            print_json(&report)?;
        } else {
            print_report(&report);
        }

        if failed == 0 {
            Ok(())
        } else {
            Err(anyhow!("check found {} failing checks", failed))
        }
    }
}

fn print_report(report: &CheckReport) {
    println!("objsim check");
    println!("  build:  {}", report.build_dir);
    println!("  input:  {}", report.input_csv);
    println!("  output: {}", report.output_dir);
    println!();
    for check in &report.checks {
        let status = if check.passed { "PASS" } else { "FAIL" };
        println!("[{}] {}: {}", status, check.name, check.detail);
    }
    println!();
    println!(
        "Summary: {} passed, {} failed",
        report.checks.len() - report.failed,
        report.failed
    );
}
