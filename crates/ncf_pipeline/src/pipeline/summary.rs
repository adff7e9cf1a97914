//! Human-readable sizing report for a [`DataConstructor`](super::DataConstructor).

use std::fmt;

const SPACER: &str = "  ";

/// Counts and sizes fixed when the constructor is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstructorSummary {
    pub num_users: usize,
    pub num_items: usize,
    pub train_positive_count: usize,
    pub train_batch_size: usize,
    pub train_batches_per_epoch: usize,
    pub eval_positive_count: usize,
    pub eval_batch_size: usize,
    pub eval_batches_per_epoch: usize,
}

impl fmt::Display for ConstructorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "General:")?;
        writeln!(f, "{SPACER}Num users: {}", self.num_users)?;
        writeln!(f, "{SPACER}Num items: {}", self.num_items)?;
        writeln!(f)?;
        writeln!(f, "Training:")?;
        writeln!(f, "{SPACER}Positive count:          {}", self.train_positive_count)?;
        writeln!(f, "{SPACER}Batch size:              {}", self.train_batch_size)?;
        writeln!(f, "{SPACER}Batch count per epoch:   {}", self.train_batches_per_epoch)?;
        writeln!(f)?;
        writeln!(f, "Eval:")?;
        writeln!(f, "{SPACER}Positive count:          {}", self.eval_positive_count)?;
        writeln!(f, "{SPACER}Batch size:              {}", self.eval_batch_size)?;
        write!(f, "{SPACER}Batch count per epoch:   {}", self.eval_batches_per_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_all_sections() {
        let summary = ConstructorSummary {
            num_users: 5,
            num_items: 7,
            train_positive_count: 10,
            train_batch_size: 4,
            train_batches_per_epoch: 5,
            eval_positive_count: 5,
            eval_batch_size: 6,
            eval_batches_per_epoch: 3,
        };
        let text = summary.to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "General:");
        assert_eq!(lines[1], "  Num users: 5");
        assert_eq!(lines[2], "  Num items: 7");
        assert_eq!(lines[4], "Training:");
        assert_eq!(lines[7], "  Batch count per epoch:   5");
        assert_eq!(lines[9], "Eval:");
        assert_eq!(lines[12], "  Batch count per epoch:   3");
        assert_eq!(lines.len(), 13);
    }
}
