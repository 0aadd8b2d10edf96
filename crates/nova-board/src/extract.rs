use nova_core::TaskDescriptor;

use crate::BoardItem;

/// One way of pulling a field out of a board item.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, item: &BoardItem) -> Option<String>;
}

/// Reads the text of a named property (title, text, status or selected option).
pub struct PropertyExtractor {
    name: String,
}

impl PropertyExtractor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl FieldExtractor for PropertyExtractor {
    fn extract(&self, item: &BoardItem) -> Option<String> {
        item.property_text(&self.name).map(str::to_string)
    }
}

impl<F> FieldExtractor for F
where
    F: Fn(&BoardItem) -> Option<String> + Send + Sync,
{
    fn extract(&self, item: &BoardItem) -> Option<String> {
        self(item)
    }
}

/// Prioritized extractors; the first one that yields a value wins.
pub struct ExtractorChain {
    extractors: Vec<Box<dyn FieldExtractor>>,
    fallback: String,
}

impl ExtractorChain {
    pub fn new(fallback: impl Into<String>) -> Self {
        Self { extractors: vec![], fallback: fallback.into() }
    }

    pub fn properties(names: &[&str], fallback: impl Into<String>) -> Self {
        names.iter().fold(Self::new(fallback), |chain, name| chain.then(PropertyExtractor::new(*name)))
    }

    pub fn then(mut self, extractor: impl FieldExtractor + 'static) -> Self {
        self.extractors.push(Box::new(extractor));
        self
    }

    pub fn first_match(&self, item: &BoardItem) -> Option<String> {
        self.extractors.iter().find_map(|e| e.extract(item))
    }

    pub fn extract_or_fallback(&self, item: &BoardItem) -> String {
        self.first_match(item).unwrap_or_else(|| self.fallback.clone())
    }
}

/// Turns board items into task descriptors.
pub struct TaskExtractors {
    pub title: ExtractorChain,
    pub description: ExtractorChain,
    pub resource: ExtractorChain,
}

impl TaskExtractors {
    pub fn with_default_resource(default_resource: &str) -> Self {
        Self {
            title: ExtractorChain::properties(&["Name", "Title"], "Untitled"),
            description: ExtractorChain::properties(
                &["Description", "description", "Notes", "notes", "Content", "content"],
                "",
            ),
            resource: ExtractorChain::properties(
                &["Repo", "Repository", "repo", "repository", "Project", "project"],
                default_resource,
            ),
        }
    }

    pub fn describe(&self, item: &BoardItem) -> TaskDescriptor {
        TaskDescriptor {
            external_ref: item.id.clone(),
            title: self.title.extract_or_fallback(item),
            description: self.description.extract_or_fallback(item),
            target_resource: self.resource.extract_or_fallback(item),
            created_time: item.created_time.clone(),
        }
    }
}
