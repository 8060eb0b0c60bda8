use crate::*;

/// Line oriented writer that can be shared between threads.
#[derive(Clone)]
pub struct FileWriter {
    file: Arc<Mutex<BufWriter<File>>>,
    path: PathBuf,
}

impl FileWriter {
    /// Creates (or truncates) the file, making parent directories as needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ChipletError::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| ChipletError::io(&path, e))?;
        Ok(Self {
            file: Arc::new(Mutex::new(BufWriter::new(file))),
            path,
        })
    }

    fn with_file(&self, f: impl FnOnce(&mut BufWriter<File>) -> io::Result<()>) -> Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| ChipletError::io(&self.path, io::Error::other(e.to_string())))?;
        f(&mut guard).map_err(|e| ChipletError::io(&self.path, e))
    }

    pub fn write(&self, data: &str) -> Result<()> {
        self.with_file(|file| file.write_all(data.as_bytes()))
    }

    pub fn write_line(&self, line: &str) -> Result<()> {
        self.with_file(|file| {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.with_file(|file| file.flush())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One part id per line, in vertex order.
pub fn write_partition(path: impl AsRef<Path>, partition: &[usize]) -> Result<()> {
    let writer = FileWriter::new(path)?;
    for p in partition {
        writer.write_line(&p.to_string())?;
    }
    writer.flush()?;
    info!("Partition written to {}", writer.path().display().to_string().blue().underline());
    Ok(())
}

/// One technology name per line, in part order.
pub fn write_techs(path: impl AsRef<Path>, techs: &[String]) -> Result<()> {
    let writer = FileWriter::new(path)?;
    for t in techs {
        writer.write_line(t)?;
    }
    writer.flush()
}

/// Reads a partition file and checks it against the hypergraph size.
pub fn read_partition_file(path: impl AsRef<Path>, num_vertices: usize) -> Result<Vec<usize>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| ChipletError::io(path, e))?;
    let mut partition = Vec::with_capacity(num_vertices);
    for (i, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| ChipletError::io(path, e))?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let part = line
            .parse::<usize>()
            .map_err(|e| ChipletError::parse(path, i + 1, format!("bad part id {line:?}: {e}")))?;
        partition.push(part);
    }
    if partition.len() != num_vertices {
        return Err(ChipletError::InvalidPartition(format!(
            "{} holds {} entries but the hypergraph has {num_vertices} vertices",
            path.display(),
            partition.len()
        )));
    }
    Ok(partition)
}

/// Headline numbers of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSummary {
    pub cost: float,
    pub valid: bool,
    pub num_parts: usize,
    pub techs: Vec<String>,
    pub aspect_ratios: Vec<float>,
    pub x: Vec<float>,
    pub y: Vec<float>,
}

impl PartitionSummary {
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let join = |v: &[float]| v.iter().map(|x| format!("{x:.4}")).join(",");
        let writer = FileWriter::new(path)?;
        writer.write_line(&format!("cost: {:.6}", self.cost))?;
        writer.write_line(&format!("valid: {}", self.valid))?;
        writer.write_line(&format!("num_parts: {}", self.num_parts))?;
        writer.write_line(&format!("techs: {}", self.techs.join(",")))?;
        writer.write_line(&format!("aspect_ratios: {}", join(&self.aspect_ratios)))?;
        writer.write_line(&format!("x: {}", join(&self.x)))?;
        writer.write_line(&format!("y: {}", join(&self.y)))?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("chiplet_part_{}_{name}", std::process::id()))
    }

    #[test]
    fn test_partition_file_round_trip() {
        let path = temp("round_trip.parts");
        write_partition(&path, &[0, 2, 1, 1]).unwrap();
        assert_eq!(read_partition_file(&path, 4).unwrap(), vec![0, 2, 1, 1]);
        assert!(matches!(
            read_partition_file(&path, 5),
            Err(ChipletError::InvalidPartition(_))
        ));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_malformed_partition_line_reports_line_number() {
        let path = temp("malformed.parts");
        fs::write(&path, "0\n1\nx\n").unwrap();
        match read_partition_file(&path, 3) {
            Err(ChipletError::Parse { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_writer_creates_directories() {
        let dir = temp("nested");
        let path = dir.join("out").join("techs.txt");
        write_techs(&path, &["7nm".to_string(), "14nm".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "7nm\n14nm\n");
        let summary = PartitionSummary {
            cost: 1.5,
            valid: true,
            num_parts: 2,
            techs: vec!["7nm".into(), "14nm".into()],
            aspect_ratios: vec![1.0, 2.0],
            x: vec![0.0, 1.0],
            y: vec![0.0, 0.0],
        };
        let summary_path = dir.join("summary.txt");
        summary.write(&summary_path).unwrap();
        let text = fs::read_to_string(&summary_path).unwrap();
        assert!(text.contains("valid: true"));
        assert!(text.contains("techs: 7nm,14nm"));
        let _ = fs::remove_dir_all(&dir);
    }
}
