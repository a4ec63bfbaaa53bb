use std::fs;
use std::path::Path;

use crate::error::KiraError;

#[derive(Debug, Clone, PartialEq)]
pub struct CountsTable {
    pub cell_names: Vec<String>,
    pub rows: Vec<GeneRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneRow {
    pub line: usize,
    pub gene: String,
    pub counts: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataTable {
    pub keys: Vec<String>,
    pub rows: Vec<MetadataRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataRow {
    pub line: usize,
    pub cell: String,
    pub values: Vec<String>,
}

pub fn read_counts(path: &Path) -> Result<CountsTable, KiraError> {
    let content =
        fs::read_to_string(path).map_err(|_| KiraError::FileRead(path.to_path_buf()))?;
    parse_counts(&path.display().to_string(), &content)
}

pub fn read_metadata(path: &Path) -> Result<MetadataTable, KiraError> {
    let content =
        fs::read_to_string(path).map_err(|_| KiraError::FileRead(path.to_path_buf()))?;
    parse_metadata(&path.display().to_string(), &content)
}

pub fn parse_counts(file: &str, content: &str) -> Result<CountsTable, KiraError> {
    let mut records = records(file, content);
    let (header_line, header) = match records.next() {
        Some(record) => record?,
        None => return Err(KiraError::EmptyInput(format!("{file}: no header row"))),
    };
    if header.len() < 2 {
        return Err(KiraError::parse(
            file,
            header_line,
            "header must name at least one cell after the gene column",
        ));
    }
    let cell_names = header[1..].to_vec();
    if let Some(pos) = cell_names.iter().position(|name| name.is_empty()) {
        return Err(KiraError::parse(
            file,
            header_line,
            format!("empty cell name in column {}", pos + 2),
        ));
    }

    let mut rows = Vec::new();
    for record in records {
        let (line, fields) = record?;
        if fields.len() != header.len() {
            return Err(KiraError::parse(
                file,
                line,
                format!("expected {} columns, found {}", header.len(), fields.len()),
            ));
        }
        let mut fields = fields.into_iter();
        let gene = fields.next().unwrap_or_default();
        if gene.is_empty() {
            return Err(KiraError::parse(file, line, "empty gene name"));
        }
        let counts = fields
            .enumerate()
            .map(|(index, field)| parse_count(&field).map_err(|message| {
                KiraError::parse(file, line, format!("column {}: {message}", index + 2))
            }))
            .collect::<Result<Vec<_>, _>>()?;
        rows.push(GeneRow { line, gene, counts });
    }

    Ok(CountsTable { cell_names, rows })
}

pub fn parse_metadata(file: &str, content: &str) -> Result<MetadataTable, KiraError> {
    let mut records = records(file, content);
    let (header_line, header) = match records.next() {
        Some(record) => record?,
        None => return Err(KiraError::EmptyInput(format!("{file}: no header row"))),
    };
    if header.is_empty() {
        return Err(KiraError::parse(file, header_line, "empty header row"));
    }
    let keys = header[1..].to_vec();
    if let Some(pos) = keys.iter().position(|key| key.is_empty()) {
        return Err(KiraError::parse(
            file,
            header_line,
            format!("empty attribute name in column {}", pos + 2),
        ));
    }

    let mut rows = Vec::new();
    for record in records {
        let (line, fields) = record?;
        if fields.len() != header.len() {
            return Err(KiraError::parse(
                file,
                line,
                format!("expected {} columns, found {}", header.len(), fields.len()),
            ));
        }
        let mut fields = fields.into_iter();
        let cell = fields.next().unwrap_or_default();
        if cell.is_empty() {
            return Err(KiraError::parse(file, line, "empty cell name"));
        }
        rows.push(MetadataRow {
            line,
            cell,
            values: fields.collect(),
        });
    }

    Ok(MetadataTable { keys, rows })
}

fn records<'a>(
    file: &'a str,
    content: &'a str,
) -> impl Iterator<Item = Result<(usize, Vec<String>), KiraError>> + 'a {
    let content = content.strip_prefix('\u{feff}').unwrap_or(content);
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(move |(index, line)| {
            let line_no = index + 1;
            split_record(line)
                .map(|fields| (line_no, fields))
                .map_err(|message| KiraError::parse(file, line_no, message))
        })
}

pub fn split_record(line: &str) -> Result<Vec<String>, String> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut fields = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|ch| *ch == ' ' || *ch == '\t') {
            chars.next();
        }
        let mut field = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') if chars.peek() == Some(&'"') => {
                        chars.next();
                        field.push('"');
                    }
                    Some('"') => break,
                    Some(ch) => field.push(ch),
                    None => return Err("unterminated quoted field".to_string()),
                }
            }
            while chars.peek().is_some_and(|ch| *ch == ' ' || *ch == '\t') {
                chars.next();
            }
            match chars.next() {
                Some(',') => fields.push(field),
                None => {
                    fields.push(field);
                    return Ok(fields);
                }
                Some(ch) => return Err(format!("unexpected character {ch:?} after quoted field")),
            }
        } else {
            loop {
                match chars.next() {
                    Some(',') => {
                        fields.push(field.trim().to_string());
                        break;
                    }
                    Some('"') => return Err("stray quote in unquoted field".to_string()),
                    Some(ch) => field.push(ch),
                    None => {
                        fields.push(field.trim().to_string());
                        return Ok(fields);
                    }
                }
            }
        }
    }
}

fn parse_count(field: &str) -> Result<f32, String> {
    let value = field
        .parse::<f32>()
        .map_err(|_| format!("non-numeric count {field:?}"))?;
    if !value.is_finite() {
        return Err(format!("non-finite count {field:?}"));
    }
    if value < 0.0 {
        return Err(format!("negative count {field:?}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn split_plain_and_quoted_fields() {
        assert_eq!(split_record("a, b ,c").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(
            split_record("\"x,y\",\"say \"\"hi\"\"\",").unwrap(),
            vec!["x,y", "say \"hi\"", ""]
        );
        assert_eq!(split_record("a,b\r").unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn split_rejects_broken_quotes() {
        assert!(split_record("\"open").is_err());
        assert!(split_record("\"a\"b,c").is_err());
        assert!(split_record("a\"b").is_err());
    }

    #[test]
    fn parse_counts_table() {
        let content = "Gene,A,B,C\ng1,1,1,0\n\ng2,0,0,2.5\n";
        let table = parse_counts("counts.csv", content).unwrap();
        assert_eq!(table.cell_names, vec!["A", "B", "C"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].line, 4);
        assert_eq!(table.rows[1].counts, vec![0.0, 0.0, 2.5]);
    }

    #[test]
    fn parse_counts_reports_file_and_line() {
        let err = parse_counts("counts.csv", "Gene,A,B\ng1,1,x\n").unwrap_err();
        assert_matches!(err, KiraError::Parse { ref file, line: 2, .. } if file == "counts.csv");

        let err = parse_counts("counts.csv", "Gene,A,B\ng1,1\n").unwrap_err();
        assert_matches!(err, KiraError::Parse { line: 2, .. });

        let err = parse_counts("counts.csv", "Gene,A\ng1,-1\n").unwrap_err();
        assert_matches!(err, KiraError::Parse { line: 2, .. });
    }

    #[test]
    fn parse_counts_requires_header() {
        assert_matches!(parse_counts("c.csv", "\n\n"), Err(KiraError::EmptyInput(_)));
        assert_matches!(parse_counts("c.csv", "Gene\n"), Err(KiraError::Parse { line: 1, .. }));
    }

    #[test]
    fn parse_metadata_table() {
        let content = "\u{feff}CellName,Type,Batch\nA,\"T cell\",1\nB,B cell,2\n";
        let table = parse_metadata("meta.csv", content).unwrap();
        assert_eq!(table.keys, vec!["Type", "Batch"]);
        assert_eq!(table.rows[0].cell, "A");
        assert_eq!(table.rows[0].values, vec!["T cell", "1"]);
        assert_eq!(table.rows[1].line, 3);
    }

    #[test]
    fn parse_metadata_reports_file_and_line() {
        let err = parse_metadata("meta.csv", "CellName,Type\nA,T\n\nB,T,extra\n").unwrap_err();
        assert_matches!(
            err,
            KiraError::Parse { ref file, line: 4, ref message }
                if file == "meta.csv" && message.contains("expected 2 columns, found 3")
        );

        let err = parse_metadata("meta.csv", "CellName,Type\n,T\n").unwrap_err();
        assert_matches!(err, KiraError::Parse { line: 2, .. });
    }
}
