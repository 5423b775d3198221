//! Built-in pipelines written out by `weave init`.

use clap::ValueEnum;
use weavecore::{LoopNode, NodeDefinition, StepDefinition, WorkflowDefinition, QUERY_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Template {
    /// Outline, write, edit
    Blog,
    /// Three parallel researchers and an aggregator
    Briefing,
    /// First draft, then a critic/refiner loop
    Story,
    /// Research, then summarize
    Research,
}

impl Template {
    pub fn definition(self) -> WorkflowDefinition {
        match self {
            Template::Blog => blog(),
            Template::Briefing => briefing(),
            Template::Story => story(),
            Template::Research => research(),
        }
    }

    /// Query used in the suggested `weave run` line
    pub fn sample_query(self) -> &'static str {
        match self {
            Template::Blog => {
                "Write a blog post about the benefits of multi-agent systems for software developers"
            }
            Template::Briefing => "Run the daily executive briefing on Tech, Health, and Finance",
            Template::Story => {
                "Write a short horror story about a lighthouse keeper who discovers a mysterious, glowing map"
            }
            Template::Research => {
                "What are the latest advancements in quantum computing and what do they mean for AI?"
            }
        }
    }
}

fn agent(name: &str, output_key: &str, instruction: &str) -> StepDefinition {
    StepDefinition::new(name, "model.generate")
        .with_output_key(output_key)
        .with_config("instruction", instruction)
}

fn sequential(name: &str, children: Vec<NodeDefinition>) -> NodeDefinition {
    NodeDefinition::Sequential {
        name: name.to_string(),
        children,
    }
}

fn blog() -> WorkflowDefinition {
    let outline = agent(
        "OutlineAgent",
        "blog_outline",
        "Create a blog outline for the given topic with a catchy headline, an \
         introduction hook, 3-5 main sections with 2-3 bullet points each, and a \
         concluding thought.",
    )
    .with_input(QUERY_KEY)
    .with_config("model", "gemini-2.5-flash");

    let writer = agent(
        "WriterAgent",
        "blog_draft",
        "Following the outline strictly, write a brief 200 to 300-word blog post \
         with an engaging and informative tone.",
    )
    .with_input("blog_outline");

    let editor = agent(
        "EditorAgent",
        "final_blog",
        "Edit the draft: fix grammatical errors, improve flow and sentence \
         structure, and enhance overall clarity.",
    )
    .with_input("blog_draft");

    WorkflowDefinition {
        name: "BlogPipeline".into(),
        description: Some("Outline, write and edit a blog post".into()),
        initial_keys: vec![QUERY_KEY.into()],
        root: sequential("BlogPipeline", vec![outline.into(), writer.into(), editor.into()]),
    }
}

fn briefing() -> WorkflowDefinition {
    let researcher = |name: &str, key: &str, instruction: &str| -> NodeDefinition {
        agent(name, key, instruction).with_input(QUERY_KEY).into()
    };

    let team = NodeDefinition::Parallel {
        name: "ParallelResearchTeam".into(),
        children: vec![
            researcher(
                "TechResearcher",
                "tech_research",
                "Research the latest AI/ML trends. Include 3 key developments, the main \
                 companies involved, and the potential impact. Keep it to 100 words.",
            ),
            researcher(
                "HealthResearcher",
                "health_research",
                "Research recent medical breakthroughs. Include 3 significant advances, \
                 their practical applications, and estimated timelines. Keep it to 100 words.",
            ),
            researcher(
                "FinanceResearcher",
                "finance_research",
                "Research current fintech trends. Include 3 key trends, their market \
                 implications, and the future outlook. Keep it to 100 words.",
            ),
        ],
    };

    let aggregator = agent(
        "AggregatorAgent",
        "executive_summary",
        "Combine the technology, health and finance findings into a single executive \
         summary of about 200 words. Highlight common themes, surprising connections \
         and the most important takeaways.",
    )
    .with_input("tech_research")
    .with_input("health_research")
    .with_input("finance_research");

    WorkflowDefinition {
        name: "ResearchSystem".into(),
        description: Some("Parallel research team with an aggregator".into()),
        initial_keys: vec![QUERY_KEY.into()],
        root: sequential("ResearchSystem", vec![team, aggregator.into()]),
    }
}

fn story() -> WorkflowDefinition {
    const LOOP: &str = "StoryRefinementLoop";
    let marker = LoopNode::default_marker_key(LOOP);

    let writer = agent(
        "InitialWriterAgent",
        "current_story",
        "Based on the user's prompt, write the first draft of a short story (around \
         100-150 words). Output only the story text.",
    )
    .with_input(QUERY_KEY);

    let critic = agent(
        "CriticAgent",
        "critique",
        "You are a constructive story critic. Evaluate the story's plot, characters \
         and pacing. If the story is well-written and complete, respond with the exact \
         phrase \"APPROVED\". Otherwise provide 2-3 specific, actionable suggestions.",
    )
    .with_input("current_story");

    let refiner = StepDefinition::new("RefinerAgent", "loop.approval_gate")
        .with_output_key("current_story")
        .with_input("current_story")
        .with_input("critique")
        .with_optional_input(marker.clone())
        .with_config(
            "instruction",
            "You are a story refiner. Rewrite the story draft incorporating the critique. \
             Output only the story text.",
        )
        .with_config("approval_key", "critique")
        .with_config("marker_key", marker.clone())
        .with_config("passthrough_key", "current_story");

    let refinement = NodeDefinition::Loop {
        name: LOOP.into(),
        children: vec![critic.into(), refiner.into()],
        max_iterations: Some(2),
        marker_key: Some(marker),
        reset_marker: false,
    };

    WorkflowDefinition {
        name: "StoryPipeline".into(),
        description: Some("Draft a story and refine it until the critic approves".into()),
        initial_keys: vec![QUERY_KEY.into()],
        root: sequential("StoryPipeline", vec![writer.into(), refinement]),
    }
}

fn research() -> WorkflowDefinition {
    let researcher = agent(
        "ResearchAgent",
        "research_findings",
        "You are a specialized research agent. Find 2-3 pieces of relevant information \
         on the given topic and present the findings with citations.",
    )
    .with_input(QUERY_KEY)
    .with_config("model", "gemini-2.5-flash");

    let summarizer = agent(
        "SummarizerAgent",
        "final_summary",
        "Read the provided research findings and create a concise summary as a \
         bulleted list with 3-5 key points.",
    )
    .with_input("research_findings");

    WorkflowDefinition {
        name: "ResearchPipeline".into(),
        description: Some("Research a topic, then summarize the findings".into()),
        initial_keys: vec![QUERY_KEY.into()],
        root: sequential("ResearchPipeline", vec![researcher.into(), summarizer.into()]),
    }
}
