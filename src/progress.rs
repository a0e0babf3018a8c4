/// Progress update callbacks
pub trait ProgressCallbacks {
    /// Initialize some progress report, `total` bytes are about to be written
    /// at `addr`
    fn init(&mut self, addr: u32, total: usize);
    /// A line of output produced by the flashing tool
    fn line(&mut self, text: &str);
    /// Finish some progress report
    fn finish(&mut self);
}
