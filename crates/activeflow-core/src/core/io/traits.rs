use crate::core::models::geometry::Geometry;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Defines the interface for reading and writing multi-frame geometry files.
///
/// Implementors handle format-specific parsing and serialization; the path
/// helpers wrap them in buffered file handles.
pub trait GeometryFile {
    /// The error type for I/O operations.
    type Error: Error + From<io::Error>;

    /// Reads every frame from a buffered reader, in file order.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing fails or the reader encounters an I/O issue.
    fn read_from(reader: &mut impl BufRead) -> Result<Vec<Geometry>, Self::Error>;

    /// Reads only the frame at `index`, returning `None` if the file has fewer frames.
    fn read_frame(reader: &mut impl BufRead, index: usize) -> Result<Option<Geometry>, Self::Error>;

    /// Counts the frames without parsing atom records.
    fn count_frames(reader: &mut impl BufRead) -> Result<usize, Self::Error>;

    /// Writes all frames, in order.
    fn write_to(geometries: &[Geometry], writer: &mut impl Write) -> Result<(), Self::Error>;

    fn read_from_path<P: AsRef<Path>>(path: P) -> Result<Vec<Geometry>, Self::Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
    }

    fn read_frame_from_path<P: AsRef<Path>>(
        path: P,
        index: usize,
    ) -> Result<Option<Geometry>, Self::Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::read_frame(&mut reader, index)
    }

    fn count_frames_in_path<P: AsRef<Path>>(path: P) -> Result<usize, Self::Error> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        Self::count_frames(&mut reader)
    }

    fn write_to_path<P: AsRef<Path>>(geometries: &[Geometry], path: P) -> Result<(), Self::Error> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        Self::write_to(geometries, &mut writer)?;
        writer.flush()?;
        Ok(())
    }
}
