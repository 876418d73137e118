//! Diagnostic output specification.
//!
//! A `DiagTable` declares which simulated fields are written, how often, and
//! into which named output files. It is materialized into the text format
//! the simulation executable reads at startup.

use crate::namelist::Namelist;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// One (module, field) entry within an output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagField {
    pub module: String,
    pub name: String,
    #[serde(default)]
    pub time_avg: bool,
}

/// One named output file with its write frequency and field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagFile {
    pub name: String,
    pub freq: u32,
    #[serde(default = "default_units")]
    pub units: String,
    /// Defaults to `units` when not given.
    #[serde(default)]
    pub time_units: Option<String>,
    #[serde(default)]
    pub fields: Vec<DiagField>,
}

fn default_units() -> String {
    "hours".to_string()
}

impl DiagFile {
    pub fn time_units(&self) -> &str {
        self.time_units.as_deref().unwrap_or(&self.units)
    }
}

/// Declarative diagnostic output table. File order is insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DiagTable {
    files: Vec<DiagFile>,
}

impl DiagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an output file. `time_units` defaults to `units`.
    ///
    /// Re-adding an existing name fully resets that file's record: the
    /// frequency and units are replaced and the accumulated field list is
    /// emptied. Callers that want to keep fields must not re-add the file.
    pub fn add_file(&mut self, name: &str, freq: u32, units: &str, time_units: Option<&str>) {
        let file = DiagFile {
            name: name.to_string(),
            freq,
            units: units.to_string(),
            time_units: time_units.map(|s| s.to_string()),
            fields: Vec::new(),
        };
        if let Some(existing) = self.files.iter_mut().find(|f| f.name == name) {
            *existing = file;
        } else {
            self.files.push(file);
        }
    }

    /// Attach a field to `files`, or, when `files` is `None`, to every file
    /// defined in the table at the time of this call. Files added later do
    /// not pick the field up retroactively. Duplicate (module, name) entries
    /// are allowed and order is preserved.
    pub fn add_field(
        &mut self,
        module: &str,
        name: &str,
        time_avg: bool,
        files: Option<&[&str]>,
    ) -> Result<()> {
        let targets: Vec<String> = match files {
            Some(names) => names.iter().map(|s| s.to_string()).collect(),
            None => self.files.iter().map(|f| f.name.clone()).collect(),
        };
        for target in targets {
            let Some(file) = self.files.iter_mut().find(|f| f.name == target) else {
                bail!("diag file {:?} is not defined", target);
            };
            file.fields.push(DiagField {
                module: module.to_string(),
                name: name.to_string(),
                time_avg,
            });
        }
        Ok(())
    }

    /// Deep, independent clone. Mutating the copy never affects the original.
    pub fn copy(&self) -> DiagTable {
        self.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> &[DiagFile] {
        &self.files
    }

    pub fn file(&self, name: &str) -> Option<&DiagFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Render the diag_table text consumed by the executable. The calendar
    /// is disabled only when `main_nml.calendar` explicitly starts with
    /// `no_calendar`; an absent calendar key leaves it enabled. Zero defined
    /// output files is a fatal configuration error.
    pub fn materialize(&self, exp_name: &str, namelist: &Namelist) -> Result<String> {
        if self.files.is_empty() {
            bail!("no output files defined in the diag table");
        }
        let calendar = namelist
            .get("main_nml", "calendar")
            .and_then(|v| v.as_str())
            .map(|c| !c.to_ascii_lowercase().starts_with("no_calendar"))
            .unwrap_or(true);

        let mut out = String::new();
        out.push_str(&format!("\"{}\"\n", exp_name));
        out.push_str(&base_date_line(calendar, namelist));
        for file in &self.files {
            out.push_str(&format!(
                "\"{}\", {}, \"{}\", 1, \"{}\", \"time\",\n",
                file.name,
                file.freq,
                file.units,
                file.time_units()
            ));
        }
        for file in &self.files {
            for field in &file.fields {
                out.push_str(&format!(
                    "\"{}\", \"{}\", \"{}\", \"{}\", \"all\", {}, \"none\", 2,\n",
                    field.module,
                    field.name,
                    field.name,
                    file.name,
                    if field.time_avg { ".true." } else { ".false." }
                ));
            }
        }
        Ok(out)
    }
}

/// Base date line: `main_nml.current_date` when a calendar is in use,
/// all zeros otherwise.
fn base_date_line(calendar: bool, namelist: &Namelist) -> String {
    use crate::namelist::NmlValue;
    if calendar {
        if let Some(NmlValue::List(items)) = namelist.get("main_nml", "current_date") {
            let rendered: Vec<String> = items.iter().map(|v| v.to_string()).collect();
            return format!("{}\n", rendered.join(" "));
        }
    }
    "0 0 0 0 0 0\n".to_string()
}
