//! Export Engine: renders canonical datapoints into XML or CSV per a
//! YAML mapper config, with inline lineage comments on XML leaves and a
//! SHA-256 fingerprint of the output bytes.
//!
//! Rendering is config-driven rather than a closed Rust type, since the
//! export targets (Fannie/Freddie/custom) are operator-configurable rather
//! than compiled in.

use crate::error::CoreError;
use crate::types::FieldValue;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::writer::Writer;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Cursor;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Xml,
    Csv,
}

/// One XML section: canonical key -> XPath-ish leaf tag name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct XmlSection {
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvMapping {
    pub header: Vec<String>,
    pub mapping: BTreeMap<String, String>,
}

/// A mapper config loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMapping {
    pub template: String,
    pub format: ExportFormat,
    pub root_element: Option<String>,
    pub required: Vec<String>,
    pub sections: Option<BTreeMap<String, XmlSection>>,
    pub csv: Option<CsvMapping>,
}

impl ExportMapping {
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml).map_err(|e| CoreError::Validation(format!("mapper config is invalid yaml: {e}")))
    }
}

/// One resolved field ready for export: its canonical value plus enough
/// evidence to render the `LINEAGE` comment.
#[derive(Debug, Clone)]
pub struct ExportField {
    pub key: String,
    pub value: FieldValue,
    pub doc_id: Option<String>,
    pub page: Option<u32>,
    pub text_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportResult {
    pub bytes: Vec<u8>,
    pub sha256: String,
    pub mime: String,
    pub filename: String,
}

/// `Queued -> Running -> Succeeded`, with an `error` escape to `Failed` from
/// either pre-terminal state. Mirrors `PayoutState` in `remittance.rs`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExportStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl ExportStatus {
    pub fn can_transition_to(self, next: ExportStatus) -> bool {
        matches!(
            (self, next),
            (ExportStatus::Queued, ExportStatus::Running)
                | (ExportStatus::Running, ExportStatus::Succeeded)
                | (ExportStatus::Queued, ExportStatus::Failed)
                | (ExportStatus::Running, ExportStatus::Failed)
        )
    }
}

/// The persisted row for one `(tenantId, loanId, template)` export submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Export {
    pub id: String,
    pub tenant_id: String,
    pub loan_id: String,
    pub template: String,
    pub status: ExportStatus,
    pub file_uri: Option<String>,
    pub file_sha256: Option<String>,
    pub errors: Vec<String>,
    pub mapper_version: String,
}

impl Export {
    pub fn queued(id: String, tenant_id: String, loan_id: String, template: String, mapper_version: String) -> Self {
        Self {
            id,
            tenant_id,
            loan_id,
            template,
            status: ExportStatus::Queued,
            file_uri: None,
            file_sha256: None,
            errors: Vec::new(),
            mapper_version,
        }
    }

    pub fn transition(&mut self, next: ExportStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::stage_violation(
                &format!("{:?}", next),
                &format!("{:?}", self.status),
            ));
        }
        self.status = next;
        Ok(())
    }

    /// Records a successful render: transitions to `Succeeded` and fills in
    /// the file location/fingerprint from the rendered `ExportResult`.
    pub fn succeed(&mut self, file_uri: String, result: &ExportResult) -> Result<(), CoreError> {
        self.transition(ExportStatus::Succeeded)?;
        self.file_uri = Some(file_uri);
        self.file_sha256 = Some(result.sha256.clone());
        Ok(())
    }

    /// Records a failed render: transitions to `Failed` and appends the
    /// error message to the row's error log.
    pub fn fail(&mut self, error: String) -> Result<(), CoreError> {
        self.transition(ExportStatus::Failed)?;
        self.errors.push(error);
        Ok(())
    }
}

/// Coerces a canonical value to the wire representation export templates expect:
/// booleans to "true"/"false", money to digits with one decimal point, everything
/// else via `Display`.
fn coerce(value: &FieldValue) -> String {
    match value {
        FieldValue::Boolean(b) => b.to_string(),
        FieldValue::Number(n) => format!("{:.1}", n),
        other => other.to_string(),
    }
}

fn quote_csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

pub struct ExportEngine;

impl ExportEngine {
    /// Verifies every mapping's required key is present and non-empty.
    fn check_required(mapping: &ExportMapping, fields: &[ExportField]) -> Result<(), CoreError> {
        let present: BTreeMap<&str, &ExportField> = fields.iter().map(|f| (f.key.as_str(), f)).collect();
        let missing: Vec<&str> = mapping
            .required
            .iter()
            .map(|k| k.as_str())
            .filter(|k| match present.get(k) {
                None => true,
                Some(field) => matches!(field.value, FieldValue::Null) || coerce(&field.value).trim().is_empty(),
            })
            .collect();

        if !missing.is_empty() {
            return Err(CoreError::Validation(format!(
                "missing required keys: [{}]",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    pub fn render(mapping: &ExportMapping, fields: &[ExportField]) -> Result<ExportResult, CoreError> {
        Self::check_required(mapping, fields)?;

        let (bytes, mime, extension) = match mapping.format {
            ExportFormat::Xml => (Self::render_xml(mapping, fields)?, "application/xml", "xml"),
            ExportFormat::Csv => (Self::render_csv(mapping, fields)?, "text/csv", "csv"),
        };

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256 = hex::encode(hasher.finalize());

        Ok(ExportResult {
            bytes,
            sha256,
            mime: mime.to_string(),
            filename: format!("{}.{}", mapping.template, extension),
        })
    }

    fn render_xml(mapping: &ExportMapping, fields: &[ExportField]) -> Result<Vec<u8>, CoreError> {
        let field_index: BTreeMap<&str, &ExportField> = fields.iter().map(|f| (f.key.as_str(), f)).collect();
        let root_name = mapping.root_element.clone().unwrap_or_else(|| mapping.template.clone());

        let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);
        writer
            .write_event(Event::Start(BytesStart::new(root_name.clone())))
            .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;

        let sections = mapping.sections.as_ref().ok_or_else(|| {
            CoreError::Fatal("xml template is missing a sections map".to_string())
        })?;

        for (section_name, section) in sections {
            writer
                .write_event(Event::Start(BytesStart::new(section_name.clone())))
                .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;

            for (canonical_key, leaf_tag) in &section.fields {
                let Some(field) = field_index.get(canonical_key.as_str()) else {
                    continue;
                };

                let comment = format!(
                    " LINEAGE canonical:{} | doc:{} | page:{} | hash:{} ",
                    canonical_key,
                    field.doc_id.as_deref().unwrap_or(""),
                    field
                        .page
                        .map(|p| p.to_string())
                        .unwrap_or_default(),
                    field.text_hash.as_deref().unwrap_or("")
                );
                writer
                    .write_event(Event::Comment(quick_xml::events::BytesText::from_escaped(comment)))
                    .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;

                writer
                    .write_event(Event::Start(BytesStart::new(leaf_tag.clone())))
                    .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;
                writer
                    .write_event(Event::Text(BytesText::new(&coerce(&field.value))))
                    .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;
                writer
                    .write_event(Event::End(BytesEnd::new(leaf_tag.clone())))
                    .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;
            }

            writer
                .write_event(Event::End(BytesEnd::new(section_name.clone())))
                .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;
        }

        writer
            .write_event(Event::End(BytesEnd::new(root_name)))
            .map_err(|e| CoreError::Fatal(format!("xml writer error: {e}")))?;

        Ok(writer.into_inner().into_inner())
    }

    fn render_csv(mapping: &ExportMapping, fields: &[ExportField]) -> Result<Vec<u8>, CoreError> {
        let csv_mapping = mapping
            .csv
            .as_ref()
            .ok_or_else(|| CoreError::Fatal("csv template is missing a csv mapping".to_string()))?;
        let field_index: BTreeMap<&str, &ExportField> = fields.iter().map(|f| (f.key.as_str(), f)).collect();

        let mut out = String::new();
        out.push_str(&csv_mapping.header.iter().map(|h| quote_csv_field(h)).collect::<Vec<_>>().join(","));
        out.push_str("\r\n");

        let row: Vec<String> = csv_mapping
            .header
            .iter()
            .map(|column| {
                let canonical_key = csv_mapping.mapping.get(column).map(|s| s.as_str()).unwrap_or(column.as_str());
                field_index
                    .get(canonical_key)
                    .map(|f| quote_csv_field(&coerce(&f.value)))
                    .unwrap_or_default()
            })
            .collect();
        out.push_str(&row.join(","));
        out.push_str("\r\n");

        Ok(out.into_bytes())
    }
}
