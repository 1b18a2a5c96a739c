/// Column aligned text table printed to stdout.
pub struct InfoTable {
    rows: Vec<Vec<String>>,
    sizes: Vec<usize>,
}

impl InfoTable {
    pub fn new(header: Vec<&str>) -> Self {
        let header = header.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let sizes = header.iter().map(|s| s.len()).collect::<Vec<_>>();
        Self {
            rows: vec![header],
            sizes,
        }
    }

    /// Adds a row, missing cells are left empty and extra cells ignored.
    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.sizes.len(), String::new());
        for (i, s) in row.iter().enumerate() {
            self.sizes[i] = self.sizes[i].max(s.len());
        }
        self.rows.push(row);
    }

    pub fn is_empty(&self) -> bool {
        self.rows.len() <= 1
    }

    /// Renders the table lines, the header and the last row are followed by
    /// a dash line.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![];
        let mut hdr_len = 0_usize;
        let last = self.sizes.len() - 1;
        for (i, row) in self.rows.iter().enumerate() {
            let line = self
                .sizes
                .iter()
                .enumerate()
                .map(|(i, &size)| format!("{0:<1$}", row[i], size + 1))
                .collect::<String>();
            let line = line.trim_end().to_string();
            if i == 0 {
                hdr_len = line.len().max(self.sizes.iter().sum::<usize>() + last);
                lines.push(line);
                lines.push(format!("{0:-<1$}", '-', hdr_len));
            } else {
                lines.push(line);
            }
        }
        if !self.is_empty() {
            lines.push(format!("{0:-<1$}", '-', hdr_len));
        }
        lines
    }

    pub fn print(&self, title: &str) {
        if !title.is_empty() {
            println!("\r\n{}", title);
        }
        for line in self.lines() {
            println!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_aligned() {
        let mut tab = InfoTable::new(vec!["name", "id"]);
        tab.push_row(vec!["web".to_string(), "1".to_string()]);
        tab.push_row(vec!["database".to_string(), "22".to_string()]);
        let lines = tab.lines();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "name     id");
        assert_eq!(lines[2], "web      1");
        assert_eq!(lines[3], "database 22");
        assert!(lines[1].chars().all(|c| c == '-'));
        assert_eq!(lines[1].len(), lines[4].len());
    }

    #[test]
    fn test_short_row_is_padded() {
        let mut tab = InfoTable::new(vec!["a", "b", "c"]);
        tab.push_row(vec!["x".to_string()]);
        assert_eq!(tab.lines()[2], "x");
        assert!(!tab.is_empty());
    }
}
