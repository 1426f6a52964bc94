use anyhow::Context;
use std::io::{Cursor, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

const MIMETYPE: &str = "application/vnd.oasis.opendocument.spreadsheet";

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Empty,
    Text(String),
    Number(f64),
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub value: CellValue,
    pub style: Option<String>,
}

impl Cell {
    pub fn empty() -> Self {
        Self {
            value: CellValue::Empty,
            style: None,
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Self {
            value: CellValue::Text(s.into()),
            style: None,
        }
    }

    pub fn number(n: f64) -> Self {
        Self {
            value: CellValue::Number(n),
            style: None,
        }
    }

    pub fn styled(mut self, style: &str) -> Self {
        self.style = Some(style.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn add_row(&mut self, cells: Vec<Cell>) {
        self.rows.push(cells);
    }
}

/// Named cell style with a solid background fill.
#[derive(Debug, Clone)]
pub struct CellStyle {
    pub name: String,
    pub background_color: String,
}

#[derive(Debug, Clone, Default)]
pub struct Spreadsheet {
    pub styles: Vec<CellStyle>,
    pub tables: Vec<Table>,
}

impl Spreadsheet {
    pub fn add_style(&mut self, name: &str, background_color: &str) {
        self.styles.push(CellStyle {
            name: name.to_string(),
            background_color: background_color.to_string(),
        });
    }

    pub fn add_table(&mut self, table: Table) {
        self.tables.push(table);
    }

    /// Serializes to a flat ODF package. The mimetype entry must come first
    /// and be stored uncompressed for consumers that sniff the container.
    pub fn bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));

        let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file("mimetype", stored)
            .context("failed to start mimetype entry")?;
        zip.write_all(MIMETYPE.as_bytes())
            .context("failed to write mimetype entry")?;

        let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);
        zip.start_file("META-INF/manifest.xml", deflated)
            .context("failed to start manifest entry")?;
        zip.write_all(manifest_xml().as_bytes())
            .context("failed to write manifest entry")?;

        zip.start_file("content.xml", deflated)
            .context("failed to start content entry")?;
        zip.write_all(self.content_xml().as_bytes())
            .context("failed to write content entry")?;

        let cursor = zip.finish().context("failed to finalize spreadsheet package")?;
        Ok(cursor.into_inner())
    }

    fn content_xml(&self) -> String {
        let mut xml = String::new();
        xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(
            "<office:document-content \
             xmlns:office=\"urn:oasis:names:tc:opendocument:xmlns:office:1.0\" \
             xmlns:table=\"urn:oasis:names:tc:opendocument:xmlns:table:1.0\" \
             xmlns:text=\"urn:oasis:names:tc:opendocument:xmlns:text:1.0\" \
             xmlns:style=\"urn:oasis:names:tc:opendocument:xmlns:style:1.0\" \
             xmlns:fo=\"urn:oasis:names:tc:opendocument:xmlns:xsl-fo-compatible:1.0\" \
             office:version=\"1.2\">",
        );

        xml.push_str("<office:automatic-styles>");
        for style in &self.styles {
            xml.push_str(&format!(
                "<style:style style:name=\"{}\" style:family=\"table-cell\">\
                 <style:table-cell-properties fo:background-color=\"{}\"/>\
                 </style:style>",
                escape_xml(&style.name),
                escape_xml(&style.background_color)
            ));
        }
        xml.push_str("</office:automatic-styles>");

        xml.push_str("<office:body><office:spreadsheet>");
        for table in &self.tables {
            xml.push_str(&format!(
                "<table:table table:name=\"{}\">",
                escape_xml(&table.name)
            ));
            for row in &table.rows {
                xml.push_str("<table:table-row>");
                for cell in row {
                    xml.push_str(&cell_xml(cell));
                }
                xml.push_str("</table:table-row>");
            }
            xml.push_str("</table:table>");
        }
        xml.push_str("</office:spreadsheet></office:body>");
        xml.push_str("</office:document-content>");
        xml
    }
}

fn cell_xml(cell: &Cell) -> String {
    let style_attr = cell
        .style
        .as_ref()
        .map(|s| format!(" table:style-name=\"{}\"", escape_xml(s)))
        .unwrap_or_default();

    match &cell.value {
        CellValue::Empty => format!("<table:table-cell{}/>", style_attr),
        CellValue::Text(s) => format!(
            "<table:table-cell{} office:value-type=\"string\"><text:p>{}</text:p></table:table-cell>",
            style_attr,
            escape_xml(s)
        ),
        CellValue::Number(n) => {
            let repr = format_number(*n);
            format!(
                "<table:table-cell{} office:value-type=\"float\" office:value=\"{}\"><text:p>{}</text:p></table:table-cell>",
                style_attr, repr, repr
            )
        }
    }
}

fn manifest_xml() -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <manifest:manifest xmlns:manifest=\"urn:oasis:names:tc:opendocument:xmlns:manifest:1.0\" manifest:version=\"1.2\">\
         <manifest:file-entry manifest:full-path=\"/\" manifest:media-type=\"{}\"/>\
         <manifest:file-entry manifest:full-path=\"content.xml\" manifest:media-type=\"text/xml\"/>\
         </manifest:manifest>",
        MIMETYPE
    )
}

/// Integral values print without a trailing ".0" so 7.0 serializes as "7".
pub fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
