use crate::dataset::{AttrValue, Dataset, Variable};
use crate::error::{PipelineError, Result};
use arrow_array::{ArrayRef, Float64Array, RecordBatch, UInt32Array};
use arrow_schema::{DataType, Field, Schema};
use csv::Writer;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use std::{fs::File, path::Path, sync::Arc};

/// Prefix of the QC flag column written next to each flagged variable.
pub const QC_PREFIX: &str = "qc_";

/// Additional formats a storage record can be exported to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Json,
}

/// Variables dimensioned by `dim`, coordinate first.
fn table_variables<'a>(ds: &'a Dataset, dim: &str) -> Result<Vec<&'a Variable>> {
    let coord = ds
        .coord(dim)
        .ok_or_else(|| PipelineError::Data(format!("no coordinate for dimension '{dim}'")))?;
    let mut vars = vec![coord];
    vars.extend(ds.data_vars().iter().filter(|v| v.dim == dim));
    Ok(vars)
}

/// Writes the variables of one dimension to a CSV table.
///
/// One column per variable followed by one `qc_<name>` column per flagged
/// variable. Values use Rust's shortest round-trip formatting.
///
/// # Errors
/// Returns error if file cannot be created or written to.
pub fn write_csv(ds: &Dataset, dim: &str, output_path: &Path) -> Result<()> {
    let vars = table_variables(ds, dim)?;
    let flagged: Vec<(&str, &[u32])> = vars
        .iter()
        .filter_map(|v| {
            ds.qc_flags(&v.name)
                .map(|f| (v.name.as_str(), f.values.as_slice()))
        })
        .collect();

    let file = File::create(output_path)?;
    let mut writer = Writer::from_writer(file);

    let mut header: Vec<String> = vars.iter().map(|v| v.name.clone()).collect();
    header.extend(flagged.iter().map(|(name, _)| format!("{QC_PREFIX}{name}")));
    writer.write_record(&header)?;

    let rows = vars.first().map(|v| v.len()).unwrap_or(0);
    for i in 0..rows {
        let mut record: Vec<String> = vars.iter().map(|v| v.data[i].to_string()).collect();
        record.extend(flagged.iter().map(|(_, flags)| flags[i].to_string()));
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}

fn attr_text(value: &AttrValue) -> String {
    match value {
        AttrValue::Text(s) => s.clone(),
        AttrValue::Number(n) => n.to_string(),
        AttrValue::List(v) => v
            .iter()
            .map(f64::to_string)
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Writes global attributes as `key,value` rows.
pub fn write_csv_header(ds: &Dataset, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)?;
    let mut writer = Writer::from_writer(file);
    for (key, value) in &ds.attrs {
        writer.write_record([key.as_str(), attr_text(value).as_str()])?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes variable metadata as `variable,attribute,value` rows, one per
/// attribute, plus a `dim` row for each variable.
///
/// # Arguments
///
/// * `ds` - Dataset whose coordinates and data variables are described
/// * `output_path` - Destination of the sidecar file
///
/// # Errors
/// Returns error if file cannot be created or written to.
pub fn write_csv_attrs(ds: &Dataset, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)?;
    let mut writer = Writer::from_writer(file);
    writer.write_record(["variable", "attribute", "value"])?;
    for var in ds.variables() {
        writer.write_record([var.name.as_str(), "dim", var.dim.as_str()])?;
        for (key, value) in &var.attrs {
            writer.write_record([var.name.as_str(), key.as_str(), attr_text(value).as_str()])?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Writes the whole dataset, attributes and QC flags included, to a
/// pretty-formatted JSON file.
///
/// # Errors
/// Returns error if file cannot be created or serialization fails.
pub fn write_json(ds: &Dataset, output_path: &Path) -> Result<()> {
    let file = File::create(output_path)?;
    serde_json::to_writer_pretty(file, ds)?;
    Ok(())
}

/// Writes the variables of one dimension to a columnar Parquet file.
///
/// Data columns are `Float64`, QC columns `UInt32`. Values are stored
/// bit-for-bit, NaN payloads included.
///
/// # Errors
/// Returns error if file cannot be created, schema is invalid, or Arrow operations fail.
pub fn write_parquet(ds: &Dataset, dim: &str, output_path: &Path) -> Result<()> {
    let vars = table_variables(ds, dim)?;

    let mut fields = Vec::new();
    let mut columns: Vec<ArrayRef> = Vec::new();
    for var in &vars {
        fields.push(Field::new(var.name.as_str(), DataType::Float64, false));
        columns.push(Arc::new(Float64Array::from(var.data.clone())));
    }
    for var in &vars {
        if let Some(flags) = ds.qc_flags(&var.name) {
            fields.push(Field::new(
                format!("{QC_PREFIX}{}", var.name),
                DataType::UInt32,
                false,
            ));
            columns.push(Arc::new(UInt32Array::from(flags.values.clone())));
        }
    }
    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema.clone(), columns)?;

    let file = File::create(output_path)?;
    let props = WriterProperties::builder().build();
    let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
    writer.write(&batch)?;
    writer.close()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Assessment, FILL_VALUE};
    use tempfile::tempdir;

    fn sample() -> Dataset {
        let mut ds = Dataset::new();
        ds.attrs.insert("title".to_string(), AttrValue::from("Buoy"));
        ds.add_coord(Variable::new("index", "index", vec![0.0, 1.0, 2.0]))
            .unwrap();
        ds.add_data_var(
            Variable::new("First Data Var", "index", vec![71.4, 71.2, 71.1])
                .with_attr(FILL_VALUE, -9999.0),
        );
        let flags = ds.qc_flags_mut("First Data Var").unwrap();
        let bit = flags.bit_for("check_max", "too warm", Assessment::Bad).unwrap();
        flags.set(0, bit);
        ds
    }

    #[test]
    fn csv_has_data_and_qc_columns() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("out.index.csv");
        write_csv(&sample(), "index", &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "index,First Data Var,qc_First Data Var");
        assert_eq!(lines[1], "0,71.4,1");
        assert_eq!(lines[3], "2,71.1,0");
    }

    #[test]
    fn csv_header_lists_attributes() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("out.hdr.csv");
        write_csv_header(&sample(), &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "title,Buoy\n");
    }

    #[test]
    fn json_contains_flags() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("out.json");
        write_json(&sample(), &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["qc"]["First Data Var"]["values"][0], 1);
    }

    #[test]
    fn unknown_dimension_is_an_error() {
        let tmp = tempdir().unwrap();
        let err = write_parquet(&sample(), "height", &tmp.path().join("x.parquet")).unwrap_err();
        assert!(matches!(err, PipelineError::Data(_)));
    }

    #[test]
    fn csv_attrs_describe_each_variable() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("out.attrs.csv");
        write_csv_attrs(&sample(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "variable,attribute,value",
                "index,dim,index",
                "First Data Var,dim,index",
                "First Data Var,_FillValue,-9999",
            ]
        );
    }
}
