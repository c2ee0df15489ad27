use crate::{
    config::{QuerySplittingBehavior, TranslationOptions},
    metadata::Model,
    sql::AliasAllocator
};

/// State shared by every translator of one query compilation.
pub struct QueryCompilationContext<'a> {
    pub model: &'a Model,
    pub options: TranslationOptions,
    pub aliases: AliasAllocator,
    /// Current collection loading mode; `AsSplitQuery`/`AsSingleQuery` override the option
    pub splitting: QuerySplittingBehavior,
}

impl<'a> QueryCompilationContext<'a> {
    pub fn new(model: &'a Model, options: TranslationOptions) -> Self {
        let splitting = options.query_splitting;
        Self { model, options, aliases: AliasAllocator::new(), splitting }
    }

    pub fn is_split_query(&self) -> bool {
        self.splitting == QuerySplittingBehavior::SplitQuery
    }
}
